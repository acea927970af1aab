fn main() {
    if let Err(err) = interview_agent::cli::run_interview_agent() {
        tracing::error!(error = %err, "interview-agent failed");
        std::process::exit(1);
    }
}

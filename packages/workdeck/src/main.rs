fn main() {
    if let Err(err) = workdeck::cli::run_workdeck() {
        tracing::error!(error = %err, "workdeck failed");
        std::process::exit(1);
    }
}

use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match diagramsync::cli::run().await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:?}", e);
            ExitCode::from(diagramsync::errors::get_exit_code(&e))
        }
    }
}

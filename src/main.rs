use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match arcchat_lib::run().await {
        Ok(code) => code,
        Err(e) => {
            log::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

use h2c_server::http::{handler_fn, HttpResponse, ServeMode, ServerConfig, Status, DEFAULT_HTTP_PORT};
use h2c_server::net::Listener;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: h2c-server [--prior-knowledge] [ADDR]";

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut addr = format!("0.0.0.0:{}", DEFAULT_HTTP_PORT);
    let mut mode = ServeMode::Auto;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--prior-knowledge" => mode = ServeMode::PriorKnowledgeOnly,
            "-h" | "--help" => {
                println!("{}", USAGE);
                return ExitCode::SUCCESS;
            }
            _ if arg.starts_with('-') => {
                eprintln!("{}", USAGE);
                return ExitCode::FAILURE;
            }
            _ => addr = arg,
        }
    }

    let config = match ServerConfig::builder().mode(mode).build() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let handler = handler_fn(|request| {
        let body = format!("Hi, <{}>! Secure cnxn? <{}>\n", request.path(), request.secure());
        Ok(HttpResponse::builder()
            .status(Status::OK)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body.into_bytes())
            .build())
    });

    let listener = match Listener::bind(addr.as_str(), handler, config) {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(error = %err, "cannot start server");
            return ExitCode::FAILURE;
        }
    };

    match listener.serve() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "server stopped");
            ExitCode::FAILURE
        }
    }
}

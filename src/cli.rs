use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "fabric-aggregator", about = "Fabric telemetry aggregator")]
pub struct Args {
    /// Address to bind the query surface on.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind the query surface on.
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Print the OpenAPI document and exit.
    #[arg(long, default_value_t = false)]
    pub print_openapi: bool,
}

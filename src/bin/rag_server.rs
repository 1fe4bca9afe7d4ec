use anyhow::Result;
use clap::Parser;

use scantree::server::{ServerArgs, run_rag_server};

#[tokio::main]
async fn main() -> Result<()> {
    let args = ServerArgs::parse();
    run_rag_server(args).await
}

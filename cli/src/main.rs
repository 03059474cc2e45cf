//! The main entrypoint for labflash, which just performs global initialization
//! and then calls out into the library.

async fn run() -> labflash_lib::Result<()> {
    labflash_utils::initialize_tracing();
    tracing::trace!("starting");
    labflash_lib::cli::run_from_iter(std::env::args()).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = run().await {
        tracing::error!("{:#}", e);
        std::process::exit(e.exit_code());
    }
}

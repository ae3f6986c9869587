use anyhow::bail;
use space_wasm::{Config, Wasm};
use tokio::runtime::Handle;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let Some(path) = args.next() else {
        bail!("usage: space-wasm <module.wasm> [config.toml | -]");
    };
    let config = Config::get_config(args.next());
    let bytes = std::fs::read(&path)?;
    tracing::info!("loaded {} ({} bytes)", path, bytes.len());

    let runtime = Handle::current();
    let delivered = tokio::task::spawn_blocking(move || -> space_wasm::Result<usize> {
        let mut wasm = Wasm::from_config(&bytes, &config, runtime)?;
        wasm.call(&config.wasm.entry, &[])?;
        wasm.run_until_idle()
    })
    .await??;

    tracing::info!("guest is idle, {} completions delivered", delivered);
    Ok(())
}

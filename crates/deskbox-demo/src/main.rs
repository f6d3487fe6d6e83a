//! deskbox-demo: drives one sandbox end to end.
//!
//! Creates a desktop, prints its stream URL, takes a screenshot, clicks
//! around and kills the sandbox again.

mod config;

use anyhow::Context;
use config::DemoConfig;
use deskbox_core::{ClientConfig, SandboxId, ScreenSize, SessionManager};
use rand::Rng;
use std::path::Path;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("deskbox_demo=info".parse()?)
                .add_directive("deskbox_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = DemoConfig::from_env()?;
    tracing::info!(?config, "Configuration loaded");

    let manager = SessionManager::connect(ClientConfig::new(config.endpoint.clone()));
    let session = manager
        .create(config.session_config()?)
        .await
        .context("failed to create sandbox")?;
    let id = session.id().clone();
    tracing::info!(sandbox_id = %id, stream_auth = session.stream_auth_enabled(), "Sandbox ready");

    let result = run(&manager, &id, &config).await;

    // Kill even if the run failed part way.
    if let Err(e) = manager.kill(&id).await {
        tracing::warn!(sandbox_id = %id, error = %e, "Failed to kill sandbox");
    } else {
        tracing::info!(sandbox_id = %id, "Sandbox killed");
    }
    result
}

async fn run(manager: &SessionManager, id: &SandboxId, config: &DemoConfig) -> anyhow::Result<()> {
    let stream = manager.stream();
    stream.start(id).await.context("failed to start stream")?;
    let url = stream.get_url(id).await?;
    println!("stream: {url}");

    let display = manager.display();
    let input = manager.input();

    let size = display.screen_size(id).await?;
    tracing::info!(width = size.width, height = size.height, "Screen size");

    save_screenshot(&display.screenshot(id).await?, &config.output_dir.join("1.png")).await?;

    input.move_mouse(id, 100, 100).await?;
    input.left_click(id).await?;

    save_screenshot(&display.screenshot(id).await?, &config.output_dir.join("2.png")).await?;

    for (x, y) in random_points(size, config.right_clicks) {
        tracing::info!(x, y, "Right click");
        input.move_mouse(id, x, y).await?;
        input.right_click(id).await?;
    }

    let cursor = input.get_cursor_position(id).await?;
    tracing::info!(x = cursor.x, y = cursor.y, "Final cursor position");
    Ok(())
}

fn random_points(size: ScreenSize, count: u32) -> Vec<(u32, u32)> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| {
            (
                rng.gen_range(0..size.width.max(1)),
                rng.gen_range(0..size.height.max(1)),
            )
        })
        .collect()
}

async fn save_screenshot(png: &[u8], path: &Path) -> anyhow::Result<()> {
    tokio::fs::write(path, png)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!(path = %path.display(), len = png.len(), "Saved screenshot");
    Ok(())
}

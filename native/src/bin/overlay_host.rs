extern crate overlay_bridge;

use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

use overlay_bridge::overlay::{Collaborators, HeadlessTextureFactory, HeadlessViewFactory, HostSession};
use overlay_bridge::{BridgeConfig, BridgeResult, HostPipes};

const TARGET_EXIT_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    // Load or ignore .env file
    let _ = dotenvy::dotenv();

    overlay_bridge::logging::init_logger();
    overlay_bridge::logging::init_crash_logger();

    info!("[HOST] Overlay bridge host v{}", overlay_bridge::get_version());

    if let Err(e) = run().await {
        error!("[HOST] Fatal: {}", e);
        overlay_bridge::logging::log_critical_error("Overlay Host", &e.to_string());
        if let Some(path) = overlay_bridge::logging::crash_log_path() {
            error!("[HOST] Details written to {}", path);
        }
        std::process::exit(1);
    }
}

async fn run() -> BridgeResult<()> {
    let config = BridgeConfig::from_env()?;
    let program = config.require_target_program()?.clone();

    let HostPipes {
        server,
        client,
        mut remote,
    } = HostPipes::open(config.max_message_size)?;

    // No GPU backend is linked into this binary.
    warn!("[HOST] Running with headless overlay collaborators");
    let collaborators = Collaborators {
        textures: Arc::new(HeadlessTextureFactory::new()),
        views: Arc::new(HeadlessViewFactory::default()),
    };
    let session = HostSession::start(
        server,
        client,
        remote.exchange_handles(),
        &config,
        collaborators,
    )
    .await?;

    remote.mark_inheritable()?;
    let mut command = Command::new(&program);
    command
        .args(&config.target_args)
        .envs(remote.launch_handles().to_env())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            remote.close();
            session.shutdown().await;
            return Err(e.into());
        }
    };
    info!("[HOST] Launched {:?} (pid {:?})", program, child.id());

    if let Err(e) = session
        .handshake()
        .wait_for_target(&mut child, config.handshake_timeout)
        .await
    {
        let _ = child.kill().await;
        remote.close();
        session.shutdown().await;
        return Err(e);
    }

    // The target owns its ends now; its exit must read as end-of-stream here.
    remote.close();

    tokio::select! {
        _ = session.wait_closed() => info!("[HOST] Target disconnected"),
        status = child.wait() => match status {
            Ok(status) => info!("[HOST] Target exited with {}", status),
            Err(e) => warn!("[HOST] Lost track of target: {}", e),
        },
        _ = tokio::signal::ctrl_c() => info!("[HOST] Interrupted, shutting down"),
    }

    session.shutdown().await;

    if tokio::time::timeout(TARGET_EXIT_GRACE, child.wait()).await.is_err() {
        warn!("[HOST] Target still running after {:?}, killing it", TARGET_EXIT_GRACE);
        let _ = child.kill().await;
    }

    info!("[HOST] Bye");
    Ok(())
}

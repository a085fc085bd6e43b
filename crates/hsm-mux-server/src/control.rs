//! Operator controls delivered as Unix signals. SIGUSR1 unlocks the router;
//! SIGUSR2 toggles the tamper state.

use std::sync::Arc;

use hsm_mux_core::Router;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Unlock,
    ToggleTamper,
}

pub fn apply(router: &Router, control: Control) {
    match control {
        Control::Unlock if router.tamper_detected() => {
            warn!("unlock ignored while a tamper event is active");
        }
        Control::Unlock => router.unlock(),
        Control::ToggleTamper => router.on_tamper_event(!router.tamper_detected()),
    }
    metrics::counter!("hsm_mux_operator_controls_total", "control" => format!("{control:?}"))
        .increment(1);
}

#[cfg(unix)]
pub async fn listen(router: Arc<Router>) -> anyhow::Result<()> {
    use anyhow::Context;
    use tokio::signal::unix::{SignalKind, signal};

    let mut unlock = signal(SignalKind::user_defined1()).context("failed to install SIGUSR1 handler")?;
    let mut tamper = signal(SignalKind::user_defined2()).context("failed to install SIGUSR2 handler")?;
    info!("operator controls: SIGUSR1 unlocks, SIGUSR2 toggles tamper");
    loop {
        let control = tokio::select! {
            Some(()) = unlock.recv() => Control::Unlock,
            Some(()) = tamper.recv() => Control::ToggleTamper,
            else => return Ok(()),
        };
        info!(?control, "operator control received");
        apply(&router, control);
    }
}

#[cfg(not(unix))]
pub async fn listen(_router: Arc<Router>) -> anyhow::Result<()> {
    warn!("operator controls need Unix signals; the router can only be unlocked at startup");
    Ok(())
}

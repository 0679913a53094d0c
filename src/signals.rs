use crate::supervisor::Control;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, info_span, Instrument};

/// Forwards termination signals to the control loop.
///
/// SIGTERM and SIGINT stop every process before exiting, SIGQUIT exits and
/// leaves them running.
pub fn listen(sender: UnboundedSender<Control>) -> Result<()> {
    let mut terminate =
        signal(SignalKind::terminate()).wrap_err("Failed to register SIGTERM handler")?;
    let mut interrupt =
        signal(SignalKind::interrupt()).wrap_err("Failed to register SIGINT handler")?;
    let mut quit = signal(SignalKind::quit()).wrap_err("Failed to register SIGQUIT handler")?;

    tokio::spawn(
        async move {
            loop {
                let control = select! {
                    _ = terminate.recv() => {
                        info!("Received SIGTERM");
                        Control::Shutdown
                    },
                    _ = interrupt.recv() => {
                        info!("Received SIGINT");
                        Control::Shutdown
                    },
                    _ = quit.recv() => {
                        info!("Received SIGQUIT");
                        Control::Detach
                    },
                };
                if sender.send(control).is_err() {
                    debug!("Control loop gone");
                    break;
                }
            }
        }
        .instrument(info_span!("signals")),
    );
    Ok(())
}

//! Headless ride client.
//!
//! Runs the core against a real backend with a fixed device position.
//! Useful for driving a local backend from a terminal, e.g. a driver that
//! goes online and streams its location.

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ride_core::app::ViewState;
use ride_core::event::Credentials;
use ride_core::get_current_time_ms;
use ride_core::model::GeoPosition;
use ride_core::capabilities::UiOperation;
use ride_core::shell;
use ride_core::{ClientConfig, Event};

fn fixed_position() -> Result<Option<GeoPosition>> {
    let (Ok(lat), Ok(lon)) = (std::env::var("RIDE_LAT"), std::env::var("RIDE_LON")) else {
        return Ok(None);
    };
    let lat: f64 = lat.parse().context("RIDE_LAT is not a number")?;
    let lon: f64 = lon.parse().context("RIDE_LON is not a number")?;
    let position = GeoPosition::new(lat, lon, get_current_time_ms()).context("invalid position")?;
    Ok(Some(position))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ride_core=debug,ride_shell=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ClientConfig::from_env().context("invalid configuration")?;
    tracing::info!(api = %config.api_base_url, stream = %config.stream_url, "loaded configuration");

    let position = fixed_position()?;
    let credentials = match (std::env::var("RIDE_EMAIL"), std::env::var("RIDE_PASSWORD")) {
        (Ok(email), Ok(password)) => Some(Credentials::new(email, password)),
        _ => None,
    };

    let store = shell::open_store(&config)?;
    let (handle, mut ui) = shell::start(&config, store)?;
    let mut views = handle.subscribe();

    handle.dispatch(Event::AppStarted)?;
    if let Some(position) = position {
        handle.dispatch(Event::PositionUpdated(position))?;
    }

    let mut login_sent = false;
    let mut online_sent = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, shutting down");
                break;
            }
            changed = views.changed() => {
                if changed.is_err() {
                    tracing::warn!("shell stopped");
                    break;
                }
                let view = views.borrow_and_update().clone();
                match &view.state {
                    ViewState::Login { busy: false } if !login_sent => {
                        if let Some(credentials) = credentials.clone() {
                            tracing::info!(email = %credentials.email, "logging in");
                            handle.dispatch(Event::LoginRequested(credentials))?;
                            login_sent = true;
                        }
                    }
                    ViewState::Driver(driver) => {
                        tracing::info!(online = driver.online, socket = ?driver.socket, step = ?driver.step, "driver");
                        if !driver.online && !driver.resume_pending && !online_sent && position.is_some() {
                            handle.dispatch(Event::DriverOnlineToggled(true))?;
                            online_sent = true;
                        }
                    }
                    ViewState::Passenger(passenger) => {
                        tracing::info!(step = ?passenger.step, fares = passenger.fares.len(), "passenger");
                    }
                    _ => {}
                }
            }
            Some(effect) = ui.recv() => match effect {
                UiOperation::Notify(toast) => tracing::info!(kind = ?toast.kind, "{}", toast.message),
                UiOperation::Navigate(screen) => tracing::info!(?screen, "navigate"),
                UiOperation::Map(command) => tracing::debug!(?command, "map"),
            },
        }
    }

    if online_sent {
        handle.dispatch(Event::DriverOnlineToggled(false))?;
        // Let the close frame and the stored preference go out.
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    }
    handle.shutdown().await;
    Ok(())
}

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use shared::types::ColorRgb;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use crate::controller::{Component, HubController};
use crate::device::manager::LedDeviceManager;

/// The colour currently shown on every LED.
pub struct OutputState {
    color: RwLock<ColorRgb>,
}

impl OutputState {
    pub fn new(color: ColorRgb) -> Self {
        Self {
            color: RwLock::new(color),
        }
    }

    pub fn color(&self) -> ColorRgb {
        *self.color.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_color(&self, color: ColorRgb) {
        *self.color.write().unwrap_or_else(PoisonError::into_inner) = color;
    }
}

/// Builds the frame for a device with `led_count` LEDs.
pub fn solid_frame(color: ColorRgb, led_count: u32) -> Vec<ColorRgb> {
    vec![color; led_count as usize]
}

/// Output loop - pushes a frame every refresh period and whenever the
/// controller asks for an update
pub async fn run(
    manager: Arc<Mutex<LedDeviceManager>>,
    controller: Arc<HubController>,
    output: Arc<OutputState>,
    refresh_hz: u32,
    cancel: CancellationToken,
) {
    let period = Duration::from_secs_f64(1.0 / f64::from(refresh_hz.max(1)));
    let mut refresh = tokio::time::interval(period);
    refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = refresh.tick() => {}
            _ = controller.update_requested() => {
                tracing::trace!("Output update requested");
            }
            _ = cancel.cancelled() => {
                tracing::info!("Output loop shutting down");
                break;
            }
        }

        if !controller.component_state(Component::LedDevice) {
            continue;
        }

        let manager = manager.lock().await;
        let led_count = manager.led_count().await;
        if led_count > 0 {
            manager.update_leds(solid_frame(output.color(), led_count));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solid_frame() {
        let red = ColorRgb::new(255, 0, 0);
        assert_eq!(solid_frame(red, 3), vec![red, red, red]);
        assert!(solid_frame(red, 0).is_empty());
    }

    #[test]
    fn test_color_can_be_changed() {
        let output = OutputState::new(ColorRgb::BLACK);
        output.set_color(ColorRgb::new(1, 2, 3));
        assert_eq!(output.color(), ColorRgb::new(1, 2, 3));
    }
}

use std::thread;
use shared::types::ColorRgb;
use tokio::sync::{mpsc, oneshot};
use crate::error::DeviceError;
use super::{DeviceEvents, LedDevice};

/// Commands delivered to the device thread, in the order they were sent.
pub enum DeviceCommand {
    Start(oneshot::Sender<()>),
    UpdateLeds(Vec<ColorRgb>),
    Enable,
    Disable,
    SwitchOn,
    SwitchOff,
    Stop(oneshot::Sender<()>),
    LatchTime(oneshot::Sender<i32>),
    ActiveDeviceType(oneshot::Sender<String>),
    ColorOrder(oneshot::Sender<String>),
    LedCount(oneshot::Sender<u32>),
    ComponentState(oneshot::Sender<Option<bool>>),
}

/// Handle to the dedicated thread a device lives on.
///
/// The thread runs until the command channel is closed and then hands the
/// device back through its join handle, so destruction happens on the
/// manager's terms.
pub struct DeviceWorker {
    device_type: String,
    tx: Option<mpsc::UnboundedSender<DeviceCommand>>,
    thread: thread::JoinHandle<Box<dyn LedDevice>>,
}

impl DeviceWorker {
    /// Move `device` onto a new thread. The device receives `events` when
    /// the first `Start` command arrives.
    pub fn spawn(
        device: Box<dyn LedDevice>,
        events: DeviceEvents,
        device_type: &str,
    ) -> Result<Self, DeviceError> {
        let (tx, rx) = mpsc::unbounded_channel::<DeviceCommand>();

        let thread = thread::Builder::new()
            .name("led-device".to_string())
            .spawn(move || run(device, events, rx))
            .map_err(|source| DeviceError::Spawn {
                device_type: device_type.to_string(),
                source,
            })?;

        Ok(Self {
            device_type: device_type.to_string(),
            tx: Some(tx),
            thread,
        })
    }

    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    /// Queue a command without waiting for it to be processed.
    pub fn post(&self, cmd: DeviceCommand) {
        match &self.tx {
            Some(tx) => {
                if tx.send(cmd).is_err() {
                    tracing::warn!("Device thread for {} is gone, dropping command", self.device_type);
                }
            }
            None => tracing::warn!("Device {} is detached, dropping command", self.device_type),
        }
    }

    /// Send a command and wait for the device thread to answer it.
    /// Returns `None` if the thread exited without replying.
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> DeviceCommand) -> Option<T> {
        let tx = self.tx.as_ref()?;
        let (reply, rx) = oneshot::channel();
        tx.send(make(reply)).ok()?;
        rx.await.ok()
    }

    pub async fn start(&self) -> Result<(), DeviceError> {
        self.request(DeviceCommand::Start)
            .await
            .ok_or_else(|| DeviceError::WorkerGone(self.device_type.clone()))
    }

    /// Blocks until the device has switched its LEDs off.
    pub async fn stop(&self) -> bool {
        self.request(DeviceCommand::Stop).await.is_some()
    }

    pub async fn latch_time(&self) -> Option<i32> {
        self.request(DeviceCommand::LatchTime).await
    }

    pub async fn active_device_type(&self) -> Option<String> {
        self.request(DeviceCommand::ActiveDeviceType).await
    }

    pub async fn color_order(&self) -> Option<String> {
        self.request(DeviceCommand::ColorOrder).await
    }

    pub async fn led_count(&self) -> Option<u32> {
        self.request(DeviceCommand::LedCount).await
    }

    /// Outer `None`: the thread is gone. Inner `None`: the device cannot tell.
    pub async fn component_state(&self) -> Option<Option<bool>> {
        self.request(DeviceCommand::ComponentState).await
    }

    /// Close the command channel. Nothing can be delivered afterwards and
    /// the thread exits once it has drained what was already queued.
    pub fn detach(&mut self) {
        self.tx = None;
    }

    /// Wait for the thread to exit and take the device back.
    pub async fn join(mut self) -> Result<Box<dyn LedDevice>, DeviceError> {
        self.detach();
        let device_type = self.device_type;
        let thread = self.thread;

        let joined = match tokio::task::spawn_blocking(move || thread.join()).await {
            Ok(joined) => joined,
            Err(e) => {
                // the thread may still be alive; carrying on would leave a zombie device
                tracing::error!("Could not join device thread for {}: {}", device_type, e);
                std::process::abort();
            }
        };

        joined.map_err(|_| {
            tracing::error!("Device thread for {} panicked", device_type);
            DeviceError::WorkerGone(device_type)
        })
    }
}

fn run(
    mut device: Box<dyn LedDevice>,
    events: DeviceEvents,
    mut rx: mpsc::UnboundedReceiver<DeviceCommand>,
) -> Box<dyn LedDevice> {
    let mut events = Some(events);

    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            DeviceCommand::Start(reply) => {
                match events.take() {
                    Some(events) => device.start(events),
                    None => tracing::warn!("Device {} already started", device.active_device_type()),
                }
                let _ = reply.send(());
            }
            DeviceCommand::UpdateLeds(frame) => device.update_leds(&frame),
            DeviceCommand::Enable => device.enable(),
            DeviceCommand::Disable => device.disable(),
            DeviceCommand::SwitchOn => device.switch_on(),
            DeviceCommand::SwitchOff => device.switch_off(),
            DeviceCommand::Stop(reply) => {
                device.stop();
                let _ = reply.send(());
            }
            DeviceCommand::LatchTime(reply) => {
                let _ = reply.send(device.latch_time());
            }
            DeviceCommand::ActiveDeviceType(reply) => {
                let _ = reply.send(device.active_device_type());
            }
            DeviceCommand::ColorOrder(reply) => {
                let _ = reply.send(device.color_order());
            }
            DeviceCommand::LedCount(reply) => {
                let _ = reply.send(device.led_count());
            }
            DeviceCommand::ComponentState(reply) => {
                let _ = reply.send(device.component_state());
            }
        }
    }

    tracing::debug!("Device thread for {} exiting", device.active_device_type());
    device
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Counter {
        frames: Arc<Mutex<Vec<usize>>>,
        thread_names: Arc<Mutex<Vec<String>>>,
    }

    impl LedDevice for Counter {
        fn start(&mut self, _events: DeviceEvents) {
            let name = thread::current().name().unwrap_or_default().to_string();
            self.thread_names.lock().unwrap().push(name);
        }
        fn stop(&mut self) {}
        fn enable(&mut self) {}
        fn disable(&mut self) {}
        fn switch_on(&mut self) {}
        fn switch_off(&mut self) {}
        fn update_leds(&mut self, frame: &[ColorRgb]) {
            self.frames.lock().unwrap().push(frame.len());
        }
        fn active_device_type(&self) -> String {
            "counter".to_string()
        }
        fn led_count(&self) -> u32 {
            3
        }
    }

    #[tokio::test]
    async fn test_commands_run_in_order_on_device_thread() {
        let device = Counter::default();
        let frames = device.frames.clone();
        let thread_names = device.thread_names.clone();
        let (events, _rx) = DeviceEvents::channel();

        let worker = DeviceWorker::spawn(Box::new(device), events, "counter").unwrap();
        worker.start().await.unwrap();
        for len in 1..=5 {
            worker.post(DeviceCommand::UpdateLeds(vec![ColorRgb::BLACK; len]));
        }
        // a round trip queued behind the frames observes all of them
        assert_eq!(worker.led_count().await, Some(3));
        assert_eq!(*frames.lock().unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(*thread_names.lock().unwrap(), vec!["led-device".to_string()]);

        let device = worker.join().await.unwrap();
        assert_eq!(device.active_device_type(), "counter");
    }

    #[tokio::test]
    async fn test_detached_worker_answers_nothing() {
        let (events, _rx) = DeviceEvents::channel();
        let mut worker = DeviceWorker::spawn(Box::new(Counter::default()), events, "counter").unwrap();
        worker.detach();

        assert_eq!(worker.latch_time().await, None);
        assert!(!worker.stop().await);
        assert!(worker.join().await.is_ok());
    }
}

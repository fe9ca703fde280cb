use std::sync::Arc;

use settings::RenderSettings;
use tessera::{GraphicsDevice, NativeWindow, RhiError, create_device};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes, WindowId},
};

mod settings;

fn main() -> anyhow::Result<()> {
    let console_log = tracing_subscriber::fmt::Layer::new()
        .with_ansi(true)
        .with_writer(std::io::stdout);
    let subscriber = tracing_subscriber::registry().with(console_log);
    let _ = tracing::subscriber::set_global_default(subscriber);

    let settings = settings::read_settings()?;
    info!("Starting with {:?}", settings);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(settings);
    event_loop.run_app(&mut app)?;

    app.result
}

struct App {
    device: Option<GraphicsDevice>,
    window: Option<Arc<Window>>,

    settings: RenderSettings,
    frames: u64,
    minimized: bool,
    result: anyhow::Result<()>,
}

impl App {
    fn new(settings: RenderSettings) -> Self {
        Self {
            device: None,
            window: None,
            settings,
            frames: 0,
            minimized: false,
            result: Ok(()),
        }
    }

    fn init_device(&mut self, window: &Window) -> Result<GraphicsDevice, RhiError> {
        let native = NativeWindow::new(window)?;
        let size = window.inner_size();

        create_device(
            &native,
            size.width,
            size.height,
            self.settings.backend,
            &self.settings.device_desc(),
        )
    }

    fn draw(&mut self) -> Result<(), RhiError> {
        let Some(device) = self.device.as_mut() else {
            return Ok(());
        };

        device.begin_draw()?;
        device.end_draw()?;
        self.frames += 1;

        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: impl Into<anyhow::Error>) {
        let err = err.into();
        error!("{:#}", err);

        self.result = Err(err);
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let attributes = WindowAttributes::default()
            .with_title("tessera")
            .with_inner_size(PhysicalSize::new(
                self.settings.width,
                self.settings.height,
            ));

        let window = match event_loop.create_window(attributes) {
            Ok(window) => Arc::new(window),
            Err(err) => return self.fail(event_loop, err),
        };

        match self.init_device(&window) {
            Ok(device) => self.device = Some(device),
            Err(err) => return self.fail(event_loop, err),
        }

        window.request_redraw();
        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested after {} frames", self.frames);

                if let Some(device) = self.device.as_mut() {
                    if let Err(err) = device.wait_idle() {
                        return self.fail(event_loop, err);
                    }
                }

                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                self.minimized = size.width == 0 || size.height == 0;

                if let Some(window) = self.window.as_ref().filter(|_| !self.minimized) {
                    window.request_redraw();
                }
            }
            WindowEvent::RedrawRequested => {
                if self.minimized {
                    return;
                }

                if let Err(err) = self.draw() {
                    return self.fail(event_loop, err);
                }

                if self
                    .settings
                    .frame_limit
                    .is_some_and(|limit| self.frames >= limit)
                {
                    info!("Frame limit of {} reached", self.frames);
                    event_loop.exit();
                    return;
                }

                if let Some(window) = &self.window {
                    window.request_redraw();
                }
            }
            _ => {}
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.device = None;
        self.window = None;
    }
}

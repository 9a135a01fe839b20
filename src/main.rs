// trigon - a minimal Vulkan frame loop
//
// One window, one GPU, one static two-triangle mesh, drawn continuously
// until the window closes. Everything below the event loop lives in
// backend::GraphicsContext.

mod backend;
mod config;

use anyhow::{anyhow, Result};
use backend::GraphicsContext;
use config::Config;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

fn main() -> Result<()> {
    init_logging();

    let config = Config::load();
    log::info!("Starting {}", config.window.title);
    log::info!("Window: {}x{}", config.window.width, config.window.height);
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    // Setup failures are recorded by the handler; surface them as a
    // nonzero exit once the loop has wound down
    if let Some(e) = app.fatal.take() {
        return Err(e);
    }
    Ok(())
}

/// Info by default, overridable through RUST_LOG.
fn init_logging() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();
}

/// Event-loop state: the window, the graphics context once the window
/// exists, and the first fatal setup error if one occurred.
struct App {
    config: Config,
    window: Option<Arc<Window>>,
    graphics: Option<GraphicsContext>,
    fatal: Option<anyhow::Error>,
    is_minimized: bool,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let now = Instant::now();
        Self {
            config,
            window: None,
            graphics: None,
            fatal: None,
            is_minimized: false,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Refresh the title once per second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            if let Some(ref window) = self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms)",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0
                ));
            }
            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                self.fatal = Some(anyhow!(e).context("Failed to create window"));
                event_loop.exit();
                return;
            }
        };

        match GraphicsContext::new(window.clone(), &self.config) {
            Ok(graphics) => self.graphics = Some(graphics),
            Err(e) => {
                log::error!("Failed to initialize Vulkan: {:?}", e);
                self.fatal = Some(e);
                event_loop.exit();
                return;
            }
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                if let Some(ref graphics) = self.graphics {
                    let _ = graphics.wait_idle();
                }
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if size.width == 0 || size.height == 0 {
                    self.is_minimized = true;
                } else {
                    self.is_minimized = false;
                    if let Some(ref mut graphics) = self.graphics {
                        graphics.notify_resized();
                    }
                }
            }

            WindowEvent::RedrawRequested => {
                if self.is_minimized {
                    return;
                }
                if let Some(ref mut graphics) = self.graphics {
                    match graphics.draw_frame() {
                        Ok(()) => self.update_fps(),
                        Err(e) => log::error!("Render error: {:?}", e),
                    }
                }
            }

            _ => {}
        }
    }

    /// Request another redraw whenever the loop is about to idle, which
    /// keeps frames flowing without a timer.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

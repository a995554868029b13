//! Terminal loop and key handling for the debug panel.

use std::io::{self, stdout};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use fusion_runtime::host::{StaticMemoryProbe, StaticNetworkProbe};
use fusion_runtime::{task, ClientRuntime, ListenerOptions, Observable, Subscription, TaskTracker};
use ratatui::{backend::CrosstermBackend, Terminal};

use crate::model::PanelState;
use crate::scenario::{self, DemoComponent, Scenario, ROUTES};
use crate::ui;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const SCENARIO_INTERVAL: Duration = Duration::from_millis(700);

pub struct Panel {
    runtime: Arc<ClientRuntime<DemoComponent>>,
    network: Arc<StaticNetworkProbe>,
    scenario: Arc<Mutex<Scenario>>,
    pressure: Arc<AtomicBool>,
    state: Observable<PanelState>,
    tasks: TaskTracker,
    bus_tap: Subscription,
    route_cursor: usize,
    online: bool,
}

impl Panel {
    pub fn new(
        runtime: Arc<ClientRuntime<DemoComponent>>,
        memory: Arc<StaticMemoryProbe>,
        network: Arc<StaticNetworkProbe>,
    ) -> Self {
        let state = Observable::new(PanelState::default());
        let tap_state = state.clone();
        let bus_tap = runtime.bus().add_sync_listener(
            move |event| {
                let line = format!(
                    "{} {} {}",
                    event.timestamp.format("%H:%M:%S"),
                    event.kind.as_str(),
                    event.path
                );
                let _ = tap_state.update(|s| s.note_bus_event(line));
            },
            ListenerOptions::new(),
        );
        let scenario = Scenario::new(memory);
        let pressure = scenario.pressure();
        let scenario = Arc::new(Mutex::new(scenario));
        Self {
            runtime,
            network,
            scenario,
            pressure,
            state,
            tasks: TaskTracker::new(),
            bus_tap,
            route_cursor: 0,
            online: true,
        }
    }

    /// Start the snapshot poller and the simulated traffic.
    pub fn start(&mut self) {
        let runtime = Arc::clone(&self.runtime);
        let state = self.state.clone();
        self.tasks.track(task::spawn_periodic("panel.poll", POLL_INTERVAL, move || {
            let snapshot = runtime.snapshot();
            let state = state.clone();
            async move { state.update(|s| s.apply_snapshot(snapshot)).is_ok() }
        }));

        let runtime = Arc::clone(&self.runtime);
        let scenario = Arc::clone(&self.scenario);
        let state = self.state.clone();
        self.tasks.track(task::spawn_periodic("panel.scenario", SCENARIO_INTERVAL, move || {
            let runtime = Arc::clone(&runtime);
            let scenario = Arc::clone(&scenario);
            let state = state.clone();
            async move {
                if state.read(|s| s.paused).unwrap_or(true) {
                    return true;
                }
                // The lock is released before the step runs.
                let step = match scenario.lock() {
                    Ok(mut scenario) => scenario.next_step(),
                    Err(_) => return false,
                };
                let line = step.run(&runtime).await;
                tracing::debug!(action = %line, "panel.scenario.step");
                state.update(|s| s.note_activity(line)).is_ok()
            }
        }));
        tracing::info!("panel.started");
    }

    pub fn shutdown(&mut self) {
        let aborted = self.tasks.abort_all();
        self.bus_tap.unsubscribe();
        self.runtime.shutdown();
        tracing::info!(aborted, "panel.shutdown");
    }

    fn note(&self, line: impl Into<String>) -> fusion_runtime::Result<()> {
        self.state.update(|s| s.note_activity(line))
    }

    /// Returns `true` when the panel should quit.
    async fn handle_key(&mut self, key: KeyEvent) -> anyhow::Result<bool> {
        let bus = self.runtime.bus();
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => return Ok(true),
            KeyCode::Char('n') => {
                let route = ROUTES[self.route_cursor % ROUTES.len()];
                self.route_cursor += 1;
                bus.navigate(route)?;
                self.note(format!("[key] navigate {route}"))?;
            }
            KeyCode::Char('b') => {
                let location = bus.back()?;
                self.note(format!("[key] back -> {}", location.as_deref().unwrap_or("(root)")))?;
            }
            KeyCode::Char('e') => {
                bus.notify_error("Failed to fetch /api/session: network connection lost");
                self.note("[key] network error reported")?;
            }
            KeyCode::Char('a') => {
                bus.notify_error("401 Unauthorized: token expired");
                self.note("[key] auth error reported")?;
            }
            KeyCode::Char('m') => {
                let pressure = !self.pressure.fetch_xor(true, Ordering::Relaxed);
                self.state.update(|s| s.pressure = pressure)?;
                self.note(format!("[key] memory pressure {}", if pressure { "on" } else { "off" }))?;
            }
            KeyCode::Char('o') => {
                self.online = !self.online;
                self.network.set_online(self.online);
                self.note(format!("[key] network {}", if self.online { "online" } else { "offline" }))?;
            }
            KeyCode::Char('h') => {
                let report = self.runtime.errors().check_health().await;
                self.note(format!("[key] health {}", report.overall.as_str()))?;
            }
            KeyCode::Char('x') => {
                let evicted = self.runtime.registry().evict_idle();
                self.note(format!("[key] evicted {evicted}"))?;
            }
            KeyCode::Char('p') => {
                let mut queued = 0;
                for id in scenario::component_ids() {
                    if self.runtime.registry().preload(id)? {
                        queued += 1;
                    }
                }
                self.note(format!("[key] preload queued {queued}"))?;
            }
            KeyCode::Char('c') => {
                let cleared = self.runtime.errors().clear_errors();
                self.note(format!("[key] cleared {cleared} errors"))?;
            }
            KeyCode::Char(' ') => {
                self.state.update(|s| s.paused = !s.paused)?;
            }
            KeyCode::Char('t') => {
                self.state.update(|s| s.palette = s.palette.toggle())?;
            }
            _ => {}
        }
        Ok(false)
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        enable_raw_mode()?;
        let mut stdout = stdout();
        execute!(stdout, EnterAlternateScreen)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        self.start();
        let result = self.run_loop(&mut terminal).await;
        self.shutdown();

        disable_raw_mode()?;
        execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
        terminal.show_cursor()?;

        result
    }

    async fn run_loop(
        &mut self,
        terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    ) -> anyhow::Result<()> {
        let mut changes = self.state.subscribe();
        self.draw(terminal)?;

        loop {
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    self.draw(terminal)?;
                }
                event_ready = async { event::poll(Duration::from_millis(100)) } => {
                    if let Ok(true) = event_ready {
                        match event::read()? {
                            Event::Key(key) if key.kind == KeyEventKind::Press => {
                                if self.handle_key(key).await? {
                                    return Ok(());
                                }
                            }
                            Event::Resize(_, _) => self.draw(terminal)?,
                            _ => {}
                        }
                    }
                }
            }
        }
    }

    fn draw(&self, terminal: &mut Terminal<CrosstermBackend<io::Stdout>>) -> anyhow::Result<()> {
        let state = self.state.get()?;
        terminal.draw(|frame| ui::render(frame, &state))?;
        Ok(())
    }
}

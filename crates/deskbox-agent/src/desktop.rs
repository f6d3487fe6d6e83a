//! Desktop sessions on the local X server stack.
//!
//! Each sandbox is an Xvfb display running an xfce4 session. Input and
//! queries go through xdotool, xrandr and scrot; the stream is x11vnc behind
//! a noVNC proxy.

use crate::config::AgentConfig;
use crate::error::DesktopError;
use crate::exec;
use crate::keys;
use crate::protocol::{CreateSessionParams, MouseButton, ScrollDirection};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::process::Child;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Time allowed for Xvfb and the stream servers to come up.
const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a cancelled client token is remembered.
const CANCELLED_TOKEN_TTL: Duration = Duration::from_secs(600);

/// Parse `":N"` or `":N.S"` into the display number.
pub fn parse_display(display: &str) -> Option<u32> {
    let rest = display.strip_prefix(':')?;
    let number = rest.split('.').next()?;
    number.parse().ok()
}

/// Parse `xdotool getmouselocation` output (`x:12 y:34 screen:0 window:...`).
pub fn parse_mouse_location(output: &str) -> Option<(u32, u32)> {
    let mut x = None;
    let mut y = None;
    for field in output.split_whitespace() {
        if let Some(v) = field.strip_prefix("x:") {
            x = v.parse().ok();
        } else if let Some(v) = field.strip_prefix("y:") {
            y = v.parse().ok();
        }
    }
    Some((x?, y?))
}

/// First `WIDTHxHEIGHT` token in `xrandr` output.
pub fn parse_screen_size(output: &str) -> Option<(u32, u32)> {
    output
        .split(|c: char| !(c.is_ascii_digit() || c == 'x'))
        .find_map(|token| {
            let (w, h) = token.split_once('x')?;
            Some((w.parse().ok()?, h.parse().ok()?))
        })
}

/// Port `base + display`, used for the display's VNC and noVNC listeners.
fn stream_port(base: u16, display: u32) -> Result<u16, DesktopError> {
    u16::try_from(display)
        .ok()
        .and_then(|n| base.checked_add(n))
        .ok_or(DesktopError::PortRange { base, display })
}

async fn port_open(port: u16) -> bool {
    TcpStream::connect(("127.0.0.1", port)).await.is_ok()
}

/// Display server and desktop session processes.
struct Surface {
    xvfb: Child,
    xfce: Option<Child>,
}

/// Write `secret` to a file only the agent's user can read.
async fn write_secret(path: &Path, secret: &str) -> std::io::Result<()> {
    // An existing file would keep its old permissions.
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .await?;
    file.write_all(secret.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await
}

/// Running stream servers.
struct Stream {
    vnc: Child,
    novnc: Child,
    generation: u64,
    url: String,
    expiry: Option<JoinHandle<()>>,
}

/// One sandbox desktop.
pub struct Desktop {
    id: String,
    client_token: Uuid,
    display: String,
    display_num: u32,
    params: CreateSessionParams,
    work_dir: PathBuf,
    surface: tokio::sync::Mutex<Surface>,
    stream: tokio::sync::Mutex<Option<Stream>>,
    stream_generation: AtomicU64,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl Desktop {
    fn spawn_xvfb(display: &str, params: &CreateSessionParams) -> Result<Child, DesktopError> {
        let screen = format!("{}x{}x24", params.width, params.height);
        let dpi = params.dpi.to_string();
        exec::spawn(
            "Xvfb",
            [
                display,
                "-ac",
                "-screen",
                "0",
                screen.as_str(),
                "-retro",
                "-dpi",
                dpi.as_str(),
                "-nolisten",
                "tcp",
            ],
            display,
        )
    }

    async fn wait_for_display(display: &str) -> Result<(), DesktopError> {
        exec::wait_until("Xvfb", READY_TIMEOUT, move || async move {
            exec::run("xdpyinfo", ["-display", display], display).await.is_ok()
        })
        .await
    }

    async fn start_xfce(display: &str, wallpaper: Option<&Path>) -> Result<Child, DesktopError> {
        let child = exec::spawn("startxfce4", Vec::<&str>::new(), display)?;
        if let Some(wallpaper) = wallpaper {
            let path = wallpaper.to_string_lossy();
            let result = exec::run(
                "xfconf-query",
                [
                    "--create",
                    "-t",
                    "string",
                    "-c",
                    "xfce4-desktop",
                    "-p",
                    "/backdrop/screen0/monitorscreen/workspace0/last-image",
                    "-s",
                    &*path,
                ],
                display,
            )
            .await;
            if let Err(e) = result {
                debug!(error = %e, "failed to set wallpaper");
            }
        }
        Ok(child)
    }

    /// Start a fresh display with a desktop session on it.
    async fn boot(
        display: &str,
        params: &CreateSessionParams,
        wallpaper: Option<&Path>,
    ) -> Result<Surface, DesktopError> {
        let mut xvfb = Self::spawn_xvfb(display, params)?;
        if let Err(e) = Self::wait_for_display(display).await {
            exec::stop(&mut xvfb).await;
            return Err(e);
        }
        match Self::start_xfce(display, wallpaper).await {
            Ok(xfce) => Ok(Surface { xvfb, xfce: Some(xfce) }),
            Err(e) => {
                exec::stop(&mut xvfb).await;
                Err(e)
            }
        }
    }

    /// Fail with `SurfaceReset` if the display or desktop session died.
    async fn ensure_surface(&self) -> Result<(), DesktopError> {
        let mut surface = self.surface.lock().await;
        let xvfb_up = exec::is_running(&mut surface.xvfb);
        let xfce_up = surface.xfce.as_mut().map(exec::is_running).unwrap_or(false);
        if xvfb_up && xfce_up {
            Ok(())
        } else {
            warn!(sandbox_id = %self.id, xvfb_up, xfce_up, "desktop surface lost");
            Err(DesktopError::SurfaceReset(self.id.clone()))
        }
    }

    async fn xdotool<I, S>(&self, args: I) -> Result<String, DesktopError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.ensure_surface().await?;
        exec::run("xdotool", args, &self.display).await
    }

    pub async fn move_mouse(&self, x: u32, y: u32) -> Result<(), DesktopError> {
        self.xdotool(["mousemove".to_string(), "--sync".into(), x.to_string(), y.to_string()])
            .await?;
        Ok(())
    }

    pub async fn click(&self, button: MouseButton) -> Result<(), DesktopError> {
        self.xdotool(["click", button.xdotool_button()]).await?;
        Ok(())
    }

    pub async fn double_click(&self) -> Result<(), DesktopError> {
        self.xdotool(["click", "--repeat", "2", "1"]).await?;
        Ok(())
    }

    pub async fn scroll(&self, direction: ScrollDirection, amount: u32) -> Result<(), DesktopError> {
        let repeat = amount.max(1).to_string();
        self.xdotool(["click", "--repeat", repeat.as_str(), direction.xdotool_button()])
            .await?;
        Ok(())
    }

    pub async fn mouse_press(&self, button: MouseButton) -> Result<(), DesktopError> {
        self.xdotool(["mousedown", button.xdotool_button()]).await?;
        Ok(())
    }

    pub async fn mouse_release(&self, button: MouseButton) -> Result<(), DesktopError> {
        self.xdotool(["mouseup", button.xdotool_button()]).await?;
        Ok(())
    }

    pub async fn type_text(&self, text: &str, delay_ms: u32) -> Result<(), DesktopError> {
        let delay = delay_ms.to_string();
        self.xdotool(["type", "--delay", delay.as_str(), "--", text]).await?;
        Ok(())
    }

    pub async fn press_keys(&self, keys: &[String]) -> Result<(), DesktopError> {
        let chord = keys::chord(keys);
        self.xdotool(["key", chord.as_str()]).await?;
        Ok(())
    }

    pub async fn open(&self, target: &str) -> Result<(), DesktopError> {
        self.ensure_surface().await?;
        // xdg-open may block until the application exits; let it run detached.
        let mut child = exec::spawn("xdg-open", [target], &self.display)?;
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Ok(())
    }

    pub async fn cursor_position(&self) -> Result<(u32, u32), DesktopError> {
        let output = self.xdotool(["getmouselocation"]).await?;
        parse_mouse_location(&output).ok_or(DesktopError::Parse {
            program: "xdotool".to_string(),
            output,
        })
    }

    pub async fn screen_size(&self) -> Result<(u32, u32), DesktopError> {
        self.ensure_surface().await?;
        let output = exec::run("xrandr", Vec::<&str>::new(), &self.display).await?;
        parse_screen_size(&output).ok_or(DesktopError::Parse {
            program: "xrandr".to_string(),
            output,
        })
    }

    /// Capture the screen with the pointer, as base64 PNG.
    pub async fn screenshot(&self) -> Result<String, DesktopError> {
        self.ensure_surface().await?;
        let path = std::env::temp_dir().join(format!("deskbox-screenshot-{}.png", Uuid::new_v4()));
        exec::run("scrot", [OsStr::new("--pointer"), path.as_os_str()], &self.display).await?;
        let data = tokio::fs::read(&path).await;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            debug!(error = %e, path = ?path, "failed to remove screenshot file");
        }
        Ok(STANDARD.encode(data?))
    }

    /// Restart whatever part of the surface died and drop any stream.
    pub async fn refresh(&self, wallpaper: Option<&Path>) -> Result<(), DesktopError> {
        self.stop_stream().await;

        let mut surface = self.surface.lock().await;
        if !exec::is_running(&mut surface.xvfb) {
            info!(sandbox_id = %self.id, "restarting display server");
            if let Some(mut xfce) = surface.xfce.take() {
                exec::stop(&mut xfce).await;
            }
            surface.xvfb = Self::spawn_xvfb(&self.display, &self.params)?;
            Self::wait_for_display(&self.display).await?;
        }
        let xfce_up = surface.xfce.as_mut().map(exec::is_running).unwrap_or(false);
        if !xfce_up {
            info!(sandbox_id = %self.id, "restarting desktop session");
            surface.xfce = Some(Self::start_xfce(&self.display, wallpaper).await?);
        }
        Ok(())
    }

    /// Start x11vnc and noVNC. A running stream is replaced.
    pub async fn start_stream(
        self: &Arc<Self>,
        config: &AgentConfig,
        auth_token: Option<&str>,
        token_ttl: Duration,
    ) -> Result<String, DesktopError> {
        self.ensure_surface().await?;
        let mut slot = self.stream.lock().await;
        if let Some(old) = slot.take() {
            debug!(sandbox_id = %self.id, "replacing running stream");
            Self::teardown_stream(old).await;
        }

        let vnc_port = stream_port(config.vnc_base_port, self.display_num)?;
        let web_port = stream_port(config.novnc_base_port, self.display_num)?;
        let rfbport = vnc_port.to_string();

        let mut vnc_args: Vec<String> = [
            "-display",
            self.display.as_str(),
            "-forever",
            "-wait",
            "50",
            "-shared",
            "-rfbport",
            rfbport.as_str(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        match auth_token {
            Some(token) => {
                tokio::fs::create_dir_all(&self.work_dir).await?;
                let passwd = self.work_dir.join("vncpasswd");
                write_secret(&passwd, token).await?;
                vnc_args.push("-passwdfile".into());
                vnc_args.push(passwd.to_string_lossy().into_owned());
            }
            None => vnc_args.push("-nopw".into()),
        }

        let mut vnc = exec::spawn("x11vnc", &vnc_args, &self.display)?;
        if let Err(e) = exec::wait_until("x11vnc", READY_TIMEOUT, || port_open(vnc_port)).await {
            exec::stop(&mut vnc).await;
            return Err(e);
        }

        let proxy = config.novnc_web.join("utils").join("novnc_proxy");
        let novnc_args = [
            "--vnc".to_string(),
            format!("localhost:{vnc_port}"),
            "--listen".to_string(),
            web_port.to_string(),
            "--web".to_string(),
            config.novnc_web.to_string_lossy().into_owned(),
        ];
        let mut novnc = match exec::spawn(&proxy.to_string_lossy(), &novnc_args, &self.display) {
            Ok(child) => child,
            Err(e) => {
                exec::stop(&mut vnc).await;
                return Err(e);
            }
        };
        if let Err(e) = exec::wait_until("noVNC", READY_TIMEOUT, || port_open(web_port)).await {
            exec::stop(&mut novnc).await;
            exec::stop(&mut vnc).await;
            return Err(e);
        }

        let generation = self.stream_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let expiry = auth_token.map(|_| {
            let desktop = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(token_ttl).await;
                desktop.expire_stream(generation).await;
            })
        });

        let url = format!("http://{}:{}/vnc.html", config.public_host, web_port);
        info!(sandbox_id = %self.id, vnc_port, web_port, auth = auth_token.is_some(), "stream started");
        *slot = Some(Stream {
            vnc,
            novnc,
            generation,
            url: url.clone(),
            expiry,
        });
        Ok(url)
    }

    async fn expire_stream(&self, generation: u64) {
        let mut slot = self.stream.lock().await;
        if slot.as_ref().map(|s| s.generation) == Some(generation) {
            info!(sandbox_id = %self.id, "stream token expired, stopping stream");
            if let Some(mut stream) = slot.take() {
                // We are the expiry task; do not abort ourselves.
                stream.expiry = None;
                Self::teardown_stream(stream).await;
            }
        }
    }

    async fn teardown_stream(mut stream: Stream) {
        if let Some(expiry) = stream.expiry.take() {
            expiry.abort();
        }
        exec::stop(&mut stream.novnc).await;
        exec::stop(&mut stream.vnc).await;
    }

    /// Stop the stream. Returns whether one was running.
    pub async fn stop_stream(&self) -> bool {
        match self.stream.lock().await.take() {
            Some(stream) => {
                Self::teardown_stream(stream).await;
                info!(sandbox_id = %self.id, "stream stopped");
                true
            }
            None => false,
        }
    }

    /// Base URL of the running stream.
    pub async fn stream_url(&self) -> Result<String, DesktopError> {
        let mut slot = self.stream.lock().await;
        let alive = match slot.as_mut() {
            Some(stream) => exec::is_running(&mut stream.vnc) && exec::is_running(&mut stream.novnc),
            None => return Err(DesktopError::StreamNotStarted(self.id.clone())),
        };
        if !alive {
            warn!(sandbox_id = %self.id, "stream servers exited");
            if let Some(stream) = slot.take() {
                Self::teardown_stream(stream).await;
            }
            return Err(DesktopError::StreamNotStarted(self.id.clone()));
        }
        Ok(slot.as_ref().map(|s| s.url.clone()).unwrap_or_default())
    }

    async fn shutdown(&self) {
        self.stop_stream().await;
        let mut surface = self.surface.lock().await;
        if let Some(mut xfce) = surface.xfce.take() {
            exec::stop(&mut xfce).await;
        }
        exec::stop(&mut surface.xvfb).await;
        if let Err(e) = tokio::fs::remove_dir_all(&self.work_dir).await {
            debug!(error = %e, "no work dir to remove");
        }
    }
}

/// All desktops served by this agent.
pub struct DesktopHost {
    config: AgentConfig,
    sessions: RwLock<HashMap<String, Arc<Desktop>>>,
    displays: Mutex<HashSet<u32>>,
    cancelled: Mutex<HashMap<Uuid, Instant>>,
}

impl DesktopHost {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            displays: Mutex::new(HashSet::new()),
            cancelled: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Look up a live desktop.
    pub async fn get(&self, id: &str) -> Result<Arc<Desktop>, DesktopError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| DesktopError::NotFound(id.to_string()))
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    fn is_cancelled(&self, token: &Uuid) -> bool {
        self.cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(token)
    }

    fn reserve_display(&self, requested: u32) -> u32 {
        let mut displays = self.displays.lock().unwrap_or_else(PoisonError::into_inner);
        let mut n = requested;
        while displays.contains(&n) || Path::new(&format!("/tmp/.X{n}-lock")).exists() {
            n += 1;
        }
        displays.insert(n);
        n
    }

    fn release_display(&self, n: u32) {
        self.displays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&n);
    }

    /// Boot a desktop for `params`. Repeating a create with the same client
    /// token returns the sandbox already created for it.
    pub async fn create_session(
        self: &Arc<Self>,
        params: CreateSessionParams,
    ) -> Result<String, DesktopError> {
        let token = params.client_token;
        if self.is_cancelled(&token) {
            return Err(DesktopError::Provision(format!("create {token} was cancelled")));
        }
        {
            let sessions = self.sessions.read().await;
            if let Some(existing) = sessions.values().find(|d| d.client_token == token) {
                debug!(client_token = %token, sandbox_id = %existing.id, "create repeated, returning existing sandbox");
                return Ok(existing.id.clone());
            }
            if self.config.max_sessions > 0 && sessions.len() >= self.config.max_sessions {
                return Err(DesktopError::Provision(format!(
                    "max session limit reached ({})",
                    self.config.max_sessions
                )));
            }
        }

        let requested = parse_display(&params.display)
            .ok_or_else(|| DesktopError::Provision(format!("invalid display {:?}", params.display)))?;
        let display_num = self.reserve_display(requested);
        let display = format!(":{display_num}");
        let id = Uuid::new_v4().simple().to_string();
        let display_name = display.as_str();
        info!(
            sandbox_id = %id,
            client_token = %token,
            display = %display_name,
            template = %params.template,
            region = ?params.region,
            width = params.width,
            height = params.height,
            "creating desktop"
        );

        let wallpaper = self.config.wallpaper.as_deref();
        let surface = match Desktop::boot(&display, &params, wallpaper).await {
            Ok(surface) => surface,
            Err(e) => {
                self.release_display(display_num);
                warn!(sandbox_id = %id, error = %e, "desktop failed to boot");
                return Err(DesktopError::Provision(e.to_string()));
            }
        };

        let timeout = Duration::from_secs(params.sandbox_timeout_secs);
        let desktop = Arc::new(Desktop {
            work_dir: self.config.work_dir.join(&id),
            id,
            client_token: token,
            display,
            display_num,
            params,
            surface: tokio::sync::Mutex::new(surface),
            stream: tokio::sync::Mutex::new(None),
            stream_generation: AtomicU64::new(0),
            reaper: Mutex::new(None),
        });
        self.register(desktop, timeout).await
    }

    /// Publish a booted desktop and arm its reaper.
    ///
    /// The cancellation check runs under the sessions write lock, so a
    /// concurrent `cancel_create` either refuses this desktop here or finds
    /// it registered and kills it.
    async fn register(self: &Arc<Self>, desktop: Arc<Desktop>, timeout: Duration) -> Result<String, DesktopError> {
        let id = desktop.id.clone();
        let token = desktop.client_token;
        let mut sessions = self.sessions.write().await;

        if self.is_cancelled(&token) {
            drop(sessions);
            info!(sandbox_id = %id, client_token = %token, "create cancelled while booting");
            desktop.shutdown().await;
            self.release_display(desktop.display_num);
            return Err(DesktopError::Provision(format!("create {token} was cancelled")));
        }

        let host = Arc::clone(self);
        let reaper_id = id.clone();
        let reaper = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            info!(sandbox_id = %reaper_id, "sandbox timeout reached");
            if let Ok(desktop) = host.get(&reaper_id).await {
                // Detach ourselves so kill does not abort this task.
                desktop.reaper.lock().unwrap_or_else(PoisonError::into_inner).take();
            }
            if let Err(e) = host.kill(&reaper_id).await {
                debug!(sandbox_id = %reaper_id, error = %e, "sandbox already gone");
            }
        });
        *desktop.reaper.lock().unwrap_or_else(PoisonError::into_inner) = Some(reaper);

        sessions.insert(id.clone(), desktop);
        info!(sandbox_id = %id, "desktop ready");
        Ok(id)
    }

    /// Abandon the create for `token`, killing its sandbox if it exists.
    pub async fn cancel_create(&self, token: Uuid) -> Result<(), DesktopError> {
        {
            let mut cancelled = self.cancelled.lock().unwrap_or_else(PoisonError::into_inner);
            cancelled.retain(|_, at| at.elapsed() < CANCELLED_TOKEN_TTL);
            cancelled.insert(token, Instant::now());
        }
        let existing = self
            .sessions
            .read()
            .await
            .values()
            .find(|d| d.client_token == token)
            .map(|d| d.id.clone());
        if let Some(id) = existing {
            info!(sandbox_id = %id, client_token = %token, "cancelling created sandbox");
            self.kill(&id).await?;
        }
        Ok(())
    }

    pub async fn refresh(&self, id: &str) -> Result<(), DesktopError> {
        let desktop = self.get(id).await?;
        desktop.refresh(self.config.wallpaper.as_deref()).await
    }

    /// Tear a desktop down and forget it.
    pub async fn kill(&self, id: &str) -> Result<(), DesktopError> {
        let desktop = self
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| DesktopError::NotFound(id.to_string()))?;

        let reaper = desktop.reaper.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(reaper) = reaper {
            reaper.abort();
        }
        desktop.shutdown().await;
        self.release_display(desktop.display_num);
        info!(sandbox_id = %id, "desktop killed");
        Ok(())
    }

    /// Kill every desktop.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.kill(&id).await {
                warn!(sandbox_id = %id, error = %e, "failed to kill desktop on shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_display() {
        assert_eq!(parse_display(":0"), Some(0));
        assert_eq!(parse_display(":12.0"), Some(12));
        assert_eq!(parse_display("0"), None);
        assert_eq!(parse_display(":x"), None);
    }

    #[test]
    fn test_parse_mouse_location() {
        let out = "x:512 y:384 screen:0 window:62914567\n";
        assert_eq!(parse_mouse_location(out), Some((512, 384)));
        assert_eq!(parse_mouse_location("garbage"), None);
    }

    #[test]
    fn test_parse_screen_size() {
        let out = "Screen 0: minimum 8 x 8, current 1024 x 768, maximum 32767 x 32767\n\
                   screen connected 1024x768+0+0 0mm x 0mm\n   1024x768      0.00*\n";
        assert_eq!(parse_screen_size(out), Some((1024, 768)));
        assert_eq!(parse_screen_size("no modes"), None);
    }

    #[tokio::test]
    async fn test_write_secret_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!("deskbox-secret-{}", Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("vncpasswd");
        tokio::fs::write(&path, "old").await.unwrap();
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))
            .await
            .unwrap();

        write_secret(&path, "s3cr3t").await.unwrap();
        let meta = tokio::fs::metadata(&path).await.unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "s3cr3t\n");

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[test]
    fn test_stream_port() {
        assert_eq!(stream_port(5900, 1).unwrap(), 5901);
        assert!(matches!(
            stream_port(65530, 10),
            Err(DesktopError::PortRange { .. })
        ));
    }

    #[test]
    fn test_reserve_display_skips_taken() {
        let host = DesktopHost::new(AgentConfig::default());
        let first = host.reserve_display(900);
        let second = host.reserve_display(900);
        assert_ne!(first, second);
        host.release_display(first);
        assert_eq!(host.reserve_display(first), first);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let host = DesktopHost::new(AgentConfig::default());
        assert!(matches!(host.get("nope").await, Err(DesktopError::NotFound(_))));
        assert!(matches!(host.kill("nope").await, Err(DesktopError::NotFound(_))));
        assert_eq!(host.count().await, 0);
    }

    fn params(token: Uuid) -> CreateSessionParams {
        CreateSessionParams {
            client_token: token,
            template: "desktop".into(),
            region: None,
            width: 1024,
            height: 768,
            dpi: 96,
            display: ":0".into(),
            sandbox_timeout_secs: 60,
            enable_stream_auth: false,
        }
    }

    /// A desktop whose surface is a plain `sleep` process.
    fn idle_desktop(host: &DesktopHost, token: Uuid) -> Arc<Desktop> {
        let display_num = host.reserve_display(950);
        let display = format!(":{display_num}");
        let xvfb = exec::spawn("sleep", ["30"], &display).unwrap();
        let id = Uuid::new_v4().simple().to_string();
        Arc::new(Desktop {
            work_dir: std::env::temp_dir().join(format!("deskbox-test-{id}")),
            id,
            client_token: token,
            display,
            display_num,
            params: params(token),
            surface: tokio::sync::Mutex::new(Surface { xvfb, xfce: None }),
            stream: tokio::sync::Mutex::new(None),
            stream_generation: AtomicU64::new(0),
            reaper: Mutex::new(None),
        })
    }

    #[tokio::test]
    async fn test_cancelled_token_refuses_create() {
        let host = Arc::new(DesktopHost::new(AgentConfig::default()));
        let token = Uuid::new_v4();
        host.cancel_create(token).await.unwrap();

        let err = host.create_session(params(token)).await.unwrap_err();
        assert!(matches!(err, DesktopError::Provision(_)));
    }

    #[tokio::test]
    async fn test_cancel_during_boot_refuses_registration() {
        let host = Arc::new(DesktopHost::new(AgentConfig::default()));
        let token = Uuid::new_v4();
        let desktop = idle_desktop(&host, token);
        let display_num = desktop.display_num;

        host.cancel_create(token).await.unwrap();
        let err = host
            .register(desktop, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, DesktopError::Provision(_)));
        assert_eq!(host.count().await, 0);
        assert_eq!(host.reserve_display(display_num), display_num);
    }

    #[tokio::test]
    async fn test_cancel_after_registration_kills_desktop() {
        let host = Arc::new(DesktopHost::new(AgentConfig::default()));
        let token = Uuid::new_v4();
        let desktop = idle_desktop(&host, token);

        let id = host.register(desktop, Duration::from_secs(60)).await.unwrap();
        assert_eq!(host.count().await, 1);

        host.cancel_create(token).await.unwrap();
        assert_eq!(host.count().await, 0);
        assert!(matches!(host.get(&id).await, Err(DesktopError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_concurrent_cancel_never_leaves_desktop() {
        let host = Arc::new(DesktopHost::new(AgentConfig::default()));
        let token = Uuid::new_v4();
        let desktop = idle_desktop(&host, token);

        let (registered, cancelled) = tokio::join!(
            host.register(desktop, Duration::from_secs(60)),
            host.cancel_create(token)
        );
        cancelled.unwrap();
        // Whichever side won, nothing stays running for the cancelled token.
        if let Ok(id) = registered {
            assert!(host.get(&id).await.is_err());
        }
        assert_eq!(host.count().await, 0);
    }
}

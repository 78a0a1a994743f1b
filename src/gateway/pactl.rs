//! `pactl` backed gateway
//!
//! Every operation is one or more invocations of the `pactl` client. Output
//! is parsed defensively: unknown fields are ignored and a malformed record
//! only drops that record.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;

use super::args::{self, ModuleArgs};
use super::{Listing, ServerGateway};
use crate::config::GatewayConfig;
use crate::constants::{LOOPBACK_MODULE, SERVER_DEFAULT_LATENCY_MS};
use crate::error::GatewayError;
use crate::protocol::{
    ActiveRoute, Direction, Endpoint, ModuleHandle, ObservedSnapshot, Route, RouteConfig, RouteKey,
};

/// Property written into `sink_input_properties` to mark routes we created
pub const OWNER_PROPERTY: &str = "loopback_router.owner";

const CONNECTION_MARKERS: &[&str] = &[
    "connection failure",
    "connection refused",
    "connection terminated",
];

const ALREADY_EXISTS_MARKERS: &[&str] = &["already exists", "already loaded", "exists"];

/// Raw result of one pactl invocation
struct CommandOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl CommandOutput {
    fn failure_reason(&self) -> String {
        if self.stderr.is_empty() {
            "command exited with a failure status".to_string()
        } else {
            self.stderr.clone()
        }
    }
}

/// Playback stream backing a loopback module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MixerState {
    pub stream_index: u32,
    pub volume_percent: u16,
    pub muted: bool,
}

/// Gateway that shells out to `pactl`
pub struct PactlGateway {
    config: GatewayConfig,
}

impl PactlGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Value of `sink_input_properties` identifying our modules
    pub fn owner_marker(&self) -> String {
        format!("{}={}", OWNER_PROPERTY, self.config.owner_tag)
    }

    /// Full argv for a pactl invocation, wrapper included.
    ///
    /// With a wrapper the pactl command line is joined into a single trailing
    /// argument, e.g. `flatpak-spawn --host sh -c "pactl list short modules"`.
    pub fn command_line(&self, args: &[String]) -> Vec<String> {
        if self.config.command_wrapper.is_empty() {
            let mut argv = Vec::with_capacity(args.len() + 1);
            argv.push(self.config.program.clone());
            argv.extend(args.iter().cloned());
            return argv;
        }

        let mut line = self.config.program.clone();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        let mut argv = self.config.command_wrapper.clone();
        argv.push(line);
        argv
    }

    async fn run(&self, args: &[String]) -> Result<CommandOutput, GatewayError> {
        let argv = self.command_line(args);
        let shown = args.join(" ");

        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| GatewayError::Unavailable("empty command line".to_string()))?;
        let mut command = Command::new(program);
        command
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let timeout = self.config.timeout();
        let started = Instant::now();
        let output = match tokio::time::timeout(timeout, command.output()).await {
            Err(_) => {
                return Err(GatewayError::Timeout {
                    command: shown,
                    after: timeout,
                })
            }
            Ok(Err(e)) => {
                return Err(GatewayError::Unavailable(format!(
                    "failed to run {}: {}",
                    program, e
                )))
            }
            Ok(Ok(output)) => output,
        };

        tracing::debug!(
            command = %shown,
            status = ?output.status.code(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pactl finished"
        );

        let result = CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        };

        if !result.success && contains_any(&result.stderr, CONNECTION_MARKERS) {
            return Err(GatewayError::Unavailable(result.stderr));
        }
        Ok(result)
    }

    async fn list_endpoints_of(
        &self,
        direction: Direction,
    ) -> Result<Listing<Endpoint>, GatewayError> {
        let what = match direction {
            Direction::Source => "sources",
            Direction::Sink => "sinks",
        };
        let output = self.run(&strings(&["--format", "json", "list", what])).await?;
        if !output.success {
            return Err(GatewayError::Parse(format!(
                "list {} failed: {}",
                what,
                output.failure_reason()
            )));
        }
        Ok(parse_endpoints(&output.stdout, direction))
    }

    /// Playback streams of loaded modules, keyed by module handle.
    pub async fn list_mixers(&self) -> Result<HashMap<ModuleHandle, MixerState>, GatewayError> {
        let output = self
            .run(&strings(&["--format", "json", "list", "sink-inputs"]))
            .await?;
        if !output.success {
            return Err(GatewayError::Parse(format!(
                "list sink-inputs failed: {}",
                output.failure_reason()
            )));
        }
        parse_sink_inputs(&output.stdout)
    }

    /// Look up the handle of an already loaded module for `route`.
    async fn find_existing(&self, route: &Route) -> Result<Option<ModuleHandle>, GatewayError> {
        let endpoints = self.list_endpoints().await?;
        let modules = self.list_active_routes().await?;
        let snapshot = ObservedSnapshot::assemble(endpoints.items, modules.items, Vec::new());
        Ok(snapshot
            .active_routes
            .get(&RouteKey::new(route.source.clone(), route.sink.clone()))
            .map(|active| active.handle))
    }
}

#[async_trait]
impl ServerGateway for PactlGateway {
    async fn list_endpoints(&self) -> Result<Listing<Endpoint>, GatewayError> {
        let mut sources = self.list_endpoints_of(Direction::Source).await?;
        let sinks = self.list_endpoints_of(Direction::Sink).await?;

        sources.items.extend(sinks.items);
        sources.parse_errors.extend(sinks.parse_errors);
        sources.complete = sources.complete && sinks.complete;
        Ok(sources)
    }

    async fn list_active_routes(&self) -> Result<Listing<ActiveRoute>, GatewayError> {
        let output = self.run(&strings(&["list", "short", "modules"])).await?;
        if !output.success {
            return Err(GatewayError::Parse(format!(
                "list modules failed: {}",
                output.failure_reason()
            )));
        }
        let mut listing = parse_modules(&output.stdout, &self.owner_marker());

        // Volume and mute live on the module's playback stream.
        match self.list_mixers().await {
            Ok(mixers) => {
                for active in &mut listing.items {
                    if let Some(mixer) = mixers.get(&active.handle) {
                        active.route.config.volume_percent = mixer.volume_percent;
                        active.route.config.muted = mixer.muted;
                    }
                }
            }
            Err(e) if e.is_unavailable() => return Err(e),
            Err(e) => tracing::debug!("Sink inputs unavailable, assuming default mixer: {}", e),
        }

        Ok(listing)
    }

    async fn create_route(&self, route: &Route) -> Result<ModuleHandle, GatewayError> {
        let mut module_args = ModuleArgs::new();
        module_args
            .set("source", &route.source)
            .set("sink", &route.sink)
            .set("latency_msec", route.config.latency_ms)
            .set("sink_input_properties", self.owner_marker());

        let output = self
            .run(&[
                "load-module".to_string(),
                LOOPBACK_MODULE.to_string(),
                args::format(&module_args),
            ])
            .await?;

        let handle = if output.success {
            output
                .stdout
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .and_then(|line| line.parse::<ModuleHandle>().ok())
                .ok_or_else(|| {
                    GatewayError::CreateFailed(format!(
                        "no module index in output {:?}",
                        output.stdout.trim()
                    ))
                })?
        } else if contains_any(&output.stderr, ALREADY_EXISTS_MARKERS) {
            match self.find_existing(route).await? {
                Some(handle) => {
                    tracing::debug!(route = %route.key(), handle, "Route already loaded");
                    handle
                }
                None => return Err(GatewayError::CreateFailed(output.failure_reason())),
            }
        } else {
            return Err(GatewayError::CreateFailed(output.failure_reason()));
        };

        if route.config.mixer_differs(&RouteConfig::default()) {
            if let Err(e) = self
                .set_route_config(handle, route.config.volume_percent, route.config.muted)
                .await
            {
                tracing::warn!(route = %route.key(), handle, "Initial volume/mute not applied: {}", e);
            }
        }

        Ok(handle)
    }

    async fn remove_route(&self, handle: ModuleHandle) -> Result<(), GatewayError> {
        let output = self
            .run(&["unload-module".to_string(), handle.to_string()])
            .await?;
        if output.success {
            return Ok(());
        }

        let error = GatewayError::RemoveFailed(output.failure_reason());
        if error.is_permanent() {
            tracing::debug!(handle, "Module already unloaded: {}", output.stderr);
            return Ok(());
        }
        Err(error)
    }

    async fn set_route_config(
        &self,
        handle: ModuleHandle,
        volume_percent: u16,
        muted: bool,
    ) -> Result<(), GatewayError> {
        let mixers = self.list_mixers().await.map_err(|e| match e {
            GatewayError::Parse(reason) => GatewayError::ConfigFailed(reason),
            other => other,
        })?;
        let stream = mixers.get(&handle).ok_or_else(|| {
            GatewayError::ConfigFailed(format!("module {} has no playback stream", handle))
        })?;
        let index = stream.stream_index.to_string();

        let output = self
            .run(&[
                "set-sink-input-volume".to_string(),
                index.clone(),
                format!("{}%", volume_percent),
            ])
            .await?;
        if !output.success {
            return Err(GatewayError::ConfigFailed(output.failure_reason()));
        }

        let output = self
            .run(&[
                "set-sink-input-mute".to_string(),
                index,
                if muted { "1" } else { "0" }.to_string(),
            ])
            .await?;
        if !output.success {
            return Err(GatewayError::ConfigFailed(output.failure_reason()));
        }

        Ok(())
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn contains_any(text: &str, markers: &[&str]) -> bool {
    let text = text.to_ascii_lowercase();
    markers.iter().any(|marker| text.contains(marker))
}

fn json_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Deserialize)]
struct RawEndpoint {
    index: Option<Value>,
    name: Option<String>,
    description: Option<String>,
    state: Option<String>,
}

/// Parse `pactl --format json list sources|sinks`.
pub fn parse_endpoints(body: &str, direction: Direction) -> Listing<Endpoint> {
    let records: Vec<Value> = match serde_json::from_str(body) {
        Ok(records) => records,
        Err(e) => {
            tracing::warn!(?direction, "Unrecognized endpoint listing: {}", e);
            return Listing::unrecognized(format!("{:?} listing: {}", direction, e));
        }
    };

    let mut listing = Listing::new(Vec::with_capacity(records.len()));
    for (position, record) in records.into_iter().enumerate() {
        match parse_endpoint(record, direction) {
            Ok(endpoint) => listing.items.push(endpoint),
            Err(reason) => {
                tracing::warn!(?direction, position, "Skipping endpoint record: {}", reason);
                listing
                    .parse_errors
                    .push(format!("{:?} record {}: {}", direction, position, reason));
            }
        }
    }
    listing
}

fn parse_endpoint(record: Value, direction: Direction) -> Result<Endpoint, String> {
    let raw: RawEndpoint = serde_json::from_value(record).map_err(|e| e.to_string())?;
    let index = raw
        .index
        .as_ref()
        .and_then(json_u32)
        .ok_or("missing index")?;
    let id = raw.name.filter(|n| !n.is_empty()).ok_or("missing name")?;
    let live = !matches!(
        raw.state.as_deref().map(str::to_ascii_uppercase).as_deref(),
        Some("INVALID") | Some("UNLINKED")
    );

    Ok(Endpoint {
        name: raw.description.unwrap_or_else(|| id.clone()),
        id,
        index,
        direction,
        live,
    })
}

/// Parse `pactl list short modules`, keeping loopback modules only.
///
/// `owner_marker` is the `sink_input_properties` entry that marks a module as
/// created by this engine.
pub fn parse_modules(text: &str, owner_marker: &str) -> Listing<ActiveRoute> {
    let mut listing = Listing::new(Vec::new());

    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(4, '\t');
        let index = parts.next().unwrap_or_default();
        let name = parts.next().unwrap_or_default();
        if name != LOOPBACK_MODULE {
            continue;
        }

        match parse_loopback(index, parts.next().unwrap_or_default(), owner_marker) {
            Ok(active) => listing.items.push(active),
            Err(reason) => {
                tracing::warn!(line = line_no + 1, "Skipping loopback module: {}", reason);
                listing
                    .parse_errors
                    .push(format!("module line {}: {}", line_no + 1, reason));
            }
        }
    }

    listing
}

fn parse_loopback(index: &str, arguments: &str, owner_marker: &str) -> Result<ActiveRoute, String> {
    let handle: ModuleHandle = index
        .trim()
        .parse()
        .map_err(|_| format!("invalid module index {:?}", index))?;
    let module_args = args::parse(arguments).map_err(|e| format!("module {}: {}", handle, e))?;

    let source = module_args
        .get("source")
        .ok_or_else(|| format!("module {} has no source", handle))?;
    let sink = module_args
        .get("sink")
        .ok_or_else(|| format!("module {} has no sink", handle))?;
    let latency_ms = module_args
        .get_u32("latency_msec")
        .unwrap_or(SERVER_DEFAULT_LATENCY_MS);
    let owned = module_args
        .get("sink_input_properties")
        .map_or(false, |props| props.split_whitespace().any(|p| p == owner_marker));

    Ok(ActiveRoute {
        route: Route::new(
            source,
            sink,
            RouteConfig {
                latency_ms,
                ..RouteConfig::default()
            },
        ),
        handle,
        owned,
    })
}

#[derive(Deserialize)]
struct RawSinkInput {
    index: Option<Value>,
    owner_module: Option<Value>,
    mute: Option<bool>,
    volume: Option<BTreeMap<String, RawChannelVolume>>,
}

#[derive(Deserialize)]
struct RawChannelVolume {
    value: Option<u64>,
    value_percent: Option<String>,
}

impl RawChannelVolume {
    fn percent(&self) -> Option<u16> {
        if let Some(percent) = &self.value_percent {
            if let Ok(p) = percent.trim().trim_end_matches('%').trim().parse::<u16>() {
                return Some(p);
            }
        }
        // 65536 is the server's 100%
        self.value
            .map(|v| ((v * 100 + 32768) / 65536).min(u64::from(u16::MAX)) as u16)
    }
}

/// Parse `pactl --format json list sink-inputs` into per-module mixer state.
pub fn parse_sink_inputs(body: &str) -> Result<HashMap<ModuleHandle, MixerState>, GatewayError> {
    let records: Vec<Value> = serde_json::from_str(body)
        .map_err(|e| GatewayError::Parse(format!("sink-input listing: {}", e)))?;

    let mut mixers = HashMap::new();
    for record in records {
        let Ok(raw) = serde_json::from_value::<RawSinkInput>(record) else {
            continue;
        };
        let (Some(stream_index), Some(owner)) = (
            raw.index.as_ref().and_then(json_u32),
            raw.owner_module.as_ref().and_then(json_u32),
        ) else {
            continue;
        };
        let volume_percent = raw
            .volume
            .as_ref()
            .and_then(|channels| channels.values().filter_map(RawChannelVolume::percent).max())
            .unwrap_or(100);

        mixers.insert(
            owner,
            MixerState {
                stream_index,
                volume_percent,
                muted: raw.mute.unwrap_or(false),
            },
        );
    }
    Ok(mixers)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCES_JSON: &str = r#"[
        {"index": 3, "state": "RUNNING", "name": "alsa_input.usb-mic", "description": "USB Microphone", "driver": "module-alsa-card.c"},
        {"index": 4, "state": "SUSPENDED", "name": "alsa_output.hdmi.monitor", "description": "Monitor of HDMI"},
        {"state": "IDLE", "name": "broken"},
        {"index": 9, "name": "", "description": "nameless"}
    ]"#;

    const MODULES_TEXT: &str = "0\tmodule-device-restore\t\n\
        23\tmodule-loopback\tsource=3 sink=alsa_output.hdmi latency_msec=50 sink_input_properties=loopback_router.owner=loopback-router\t\n\
        24\tmodule-loopback\tsource=alsa_input.usb-mic sink=5\t\n\
        25\tmodule-loopback\tsink=5\t\n\
        26\tmodule-loopback\tsource=\"unterminated\n\
        27\tmodule-null-sink\tsink_name=virtual\n";

    const SINK_INPUTS_JSON: &str = r#"[
        {"index": 61, "driver": "module-loopback.c", "owner_module": "23", "mute": true,
         "volume": {"front-left": {"value": 98304, "value_percent": "150%", "db": "10.57 dB"},
                    "front-right": {"value": 98304, "value_percent": "150%", "db": "10.57 dB"}}},
        {"index": 62, "owner_module": 24, "mute": false,
         "volume": {"mono": {"value": 32768}}},
        {"index": 63, "owner_module": "n/a"}
    ]"#;

    fn gateway(wrapper: &[&str]) -> PactlGateway {
        PactlGateway::new(GatewayConfig {
            command_wrapper: wrapper.iter().map(|s| s.to_string()).collect(),
            ..GatewayConfig::default()
        })
    }

    #[test]
    fn test_parse_endpoints_skips_bad_records() {
        let listing = parse_endpoints(SOURCES_JSON, Direction::Source);
        assert!(listing.complete);
        assert_eq!(listing.items.len(), 2);
        assert_eq!(listing.parse_errors.len(), 2);

        let mic = &listing.items[0];
        assert_eq!(mic.id, "alsa_input.usb-mic");
        assert_eq!(mic.index, 3);
        assert_eq!(mic.name, "USB Microphone");
        assert!(mic.live);
    }

    #[test]
    fn test_parse_endpoints_unrecognized_body() {
        let listing = parse_endpoints("Failure: not json", Direction::Sink);
        assert!(!listing.complete);
        assert!(listing.items.is_empty());
        assert_eq!(listing.parse_errors.len(), 1);

        let listing = parse_endpoints(r#"{"index": 1}"#, Direction::Sink);
        assert!(!listing.complete);
    }

    #[test]
    fn test_parse_modules() {
        let listing = parse_modules(MODULES_TEXT, "loopback_router.owner=loopback-router");
        assert_eq!(listing.items.len(), 2);
        assert_eq!(listing.parse_errors.len(), 2);

        let owned = &listing.items[0];
        assert_eq!(owned.handle, 23);
        assert_eq!(owned.route.source, "3");
        assert_eq!(owned.route.sink, "alsa_output.hdmi");
        assert_eq!(owned.route.config.latency_ms, 50);
        assert!(owned.owned);

        let foreign = &listing.items[1];
        assert_eq!(foreign.handle, 24);
        assert_eq!(foreign.route.config.latency_ms, SERVER_DEFAULT_LATENCY_MS);
        assert!(!foreign.owned);
    }

    #[test]
    fn test_parse_sink_inputs() {
        let mixers = parse_sink_inputs(SINK_INPUTS_JSON).unwrap();
        assert_eq!(mixers.len(), 2);
        assert_eq!(
            mixers.get(&23),
            Some(&MixerState {
                stream_index: 61,
                volume_percent: 150,
                muted: true
            })
        );
        assert_eq!(mixers.get(&24).map(|m| m.volume_percent), Some(50));
        assert!(parse_sink_inputs("garbage").is_err());
    }

    #[test]
    fn test_command_line_without_wrapper() {
        let argv = gateway(&[]).command_line(&strings(&["list", "short", "modules"]));
        assert_eq!(argv, vec!["pactl", "list", "short", "modules"]);
    }

    #[test]
    fn test_command_line_with_wrapper() {
        let argv = gateway(&["flatpak-spawn", "--host", "sh", "-c"])
            .command_line(&strings(&["unload-module", "23"]));
        assert_eq!(
            argv,
            vec!["flatpak-spawn", "--host", "sh", "-c", "pactl unload-module 23"]
        );
    }

    #[test]
    fn test_owner_marker_matches_parser() {
        let gateway = gateway(&[]);
        let text = format!(
            "7\tmodule-loopback\tsource=a sink=b sink_input_properties={}\n",
            gateway.owner_marker()
        );
        let listing = parse_modules(&text, &gateway.owner_marker());
        assert!(listing.items[0].owned);
    }

    /// Gateway whose pactl is a shell script answering a one-route server.
    ///
    /// `commands` adds `case` arms ahead of the listing arms.
    fn scripted(commands: &str, timeout_ms: u64) -> PactlGateway {
        let script = format!(
            r#"case "$1" in
{commands}
  *"list sources"*) echo '[{{"index": 1, "name": "mic1"}}]' ;;
  *"list sinks"*) echo '[{{"index": 2, "name": "spk1"}}]' ;;
  *"list sink-inputs"*) echo '[]' ;;
  *"list short modules"*) printf '7\tmodule-loopback\tsource=mic1 sink=spk1 latency_msec=20\n' ;;
  *) echo "Failure: unexpected $1" >&2; exit 1 ;;
esac"#
        );
        PactlGateway::new(GatewayConfig {
            command_wrapper: vec!["sh".into(), "-c".into(), script, "pactl-stub".into()],
            timeout_ms,
            ..GatewayConfig::default()
        })
    }

    fn route() -> Route {
        Route::new("mic1", "spk1", RouteConfig::default())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_load_reports_new_module_index() {
        let gateway = scripted(r#"  *load-module*) echo 31 ;;"#, 5000);
        assert_eq!(gateway.create_route(&route()).await.unwrap(), 31);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_load_of_existing_route_returns_its_handle() {
        let gateway = scripted(
            r#"  *load-module*) echo 'Failure: Entity exists' >&2; exit 1 ;;"#,
            5000,
        );
        assert_eq!(gateway.create_route(&route()).await.unwrap(), 7);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_load_without_index_is_create_failure() {
        let gateway = scripted(r#"  *load-module*) echo 'module loaded' ;;"#, 5000);
        let err = gateway.create_route(&route()).await.unwrap_err();
        assert!(matches!(err, GatewayError::CreateFailed(_)), "{:?}", err);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unload_of_absent_module_succeeds() {
        let gateway = scripted(
            r#"  *unload-module*) echo 'Failure: No such entity' >&2; exit 1 ;;"#,
            5000,
        );
        assert!(gateway.remove_route(99).await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unload_failure_is_reported() {
        let gateway = scripted(
            r#"  *unload-module*) echo 'Failure: Internal error' >&2; exit 1 ;;"#,
            5000,
        );
        let err = gateway.remove_route(7).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_slow_command_times_out() {
        let gateway = scripted(r#"  *load-module*) sleep 5 ;;"#, 100);
        let err = gateway.create_route(&route()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Timeout { .. }), "{:?}", err);
        assert!(err.is_transient());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scripted_listing_round_trips() {
        let gateway = scripted("", 5000);
        let endpoints = gateway.list_endpoints().await.unwrap();
        let modules = gateway.list_active_routes().await.unwrap();
        assert_eq!(endpoints.items.len(), 2);
        assert_eq!(modules.items.len(), 1);
        assert_eq!(modules.items[0].handle, 7);
        assert!(!modules.items[0].owned);
    }

    #[tokio::test]
    async fn test_missing_program_is_unavailable() {
        let gateway = PactlGateway::new(GatewayConfig {
            program: "/nonexistent/pactl-for-tests".to_string(),
            ..GatewayConfig::default()
        });
        let err = gateway.list_endpoints().await.unwrap_err();
        assert!(err.is_unavailable());
    }
}

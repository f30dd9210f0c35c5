//! Gateway configuration: CLI flags with environment fallbacks and state-directory layout.

use clap::Args;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Inclusive TCP port interval reserved for one backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn overlaps(&self, other: &PortRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for PortRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| format!("expected <start>-<end>, got {s:?}"))?;
        let start: u16 = start
            .trim()
            .parse()
            .map_err(|e| format!("invalid start port: {e}"))?;
        let end: u16 = end
            .trim()
            .parse()
            .map_err(|e| format!("invalid end port: {e}"))?;
        if start == 0 || start > end {
            return Err(format!("empty or invalid port range {s:?}"));
        }
        Ok(Self { start, end })
    }
}

/// Options for `termgate serve`.
#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Host/IP to bind (the tunnel client connects locally)
    #[arg(long, env = "TERMGATE_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Public listen port
    #[arg(long, env = "TERMGATE_PORT", default_value_t = 7680)]
    pub port: u16,

    /// Port range for terminal backends
    #[arg(long, env = "TERMGATE_TERMINAL_PORTS", default_value = "7681-7780")]
    pub terminal_ports: PortRange,

    /// Port range for editor backends
    #[arg(long, env = "TERMGATE_EDITOR_PORTS", default_value = "8800-8899")]
    pub editor_ports: PortRange,

    /// Lifetime of a login session in hours
    #[arg(long, env = "TERMGATE_SESSION_EXPIRY_HOURS", default_value_t = 24)]
    pub session_expiry_hours: u64,

    /// Omit the Secure cookie attribute (plain-HTTP localhost deployments)
    #[arg(long, env = "TERMGATE_INSECURE_COOKIES")]
    pub insecure_cookies: bool,

    /// Directory holding credentials, sessions, tools and auth sessions
    #[arg(long, env = "TERMGATE_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Write API requests allowed per client per minute
    #[arg(long, env = "TERMGATE_API_RATE_LIMIT", default_value_t = 60)]
    pub api_rate_limit: u32,

    /// Resolve client addresses from proxy headers set by the tunnel
    #[arg(
        long,
        env = "TERMGATE_TRUST_PROXY_HEADERS",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub trust_proxy_headers: bool,
}

/// Resolved, validated configuration shared by every component.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub terminal_ports: PortRange,
    pub editor_ports: PortRange,
    pub session_expiry: Duration,
    pub secure_cookies: bool,
    pub state_dir: PathBuf,
    pub api_rate_limit: u32,
    pub api_rate_window: Duration,
    pub trust_proxy_headers: bool,
    pub ready_timeout: Duration,
}

impl GatewayConfig {
    pub fn from_args(args: ServeArgs) -> anyhow::Result<Self> {
        let state_dir = match args.state_dir {
            Some(dir) => dir,
            None => default_state_dir()?,
        };
        let config = Self {
            host: args.host,
            port: args.port,
            terminal_ports: args.terminal_ports,
            editor_ports: args.editor_ports,
            session_expiry: Duration::from_secs(args.session_expiry_hours.max(1) * 3600),
            secure_cookies: !args.insecure_cookies,
            state_dir,
            api_rate_limit: args.api_rate_limit.max(1),
            api_rate_window: Duration::from_secs(60),
            trust_proxy_headers: args.trust_proxy_headers,
            ready_timeout: Duration::from_secs(10),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.terminal_ports.overlaps(&self.editor_ports) {
            anyhow::bail!(
                "terminal range {} overlaps editor range {}",
                self.terminal_ports,
                self.editor_ports
            );
        }
        if self.terminal_ports.contains(self.port) || self.editor_ports.contains(self.port) {
            anyhow::bail!("listen port {} falls inside a backend port range", self.port);
        }
        Ok(())
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.state_dir.join("credentials.json")
    }

    pub fn auth_sessions_path(&self) -> PathBuf {
        self.state_dir.join("auth_sessions.json")
    }

    pub fn sessions_path(&self) -> PathBuf {
        self.state_dir.join("sessions.json")
    }

    pub fn tools_path(&self) -> PathBuf {
        self.state_dir.join("tools.json")
    }

    /// Parent of the per-folder editor data directories.
    pub fn editors_dir(&self) -> PathBuf {
        self.state_dir.join("editors")
    }
}

pub fn default_state_dir() -> anyhow::Result<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join("termgate"))
        .ok_or_else(|| anyhow::anyhow!("could not resolve a configuration directory; pass --state-dir"))
}

#[cfg(test)]
impl GatewayConfig {
    pub fn for_tests(state_dir: PathBuf) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7680,
            terminal_ports: PortRange::new(47681, 47700),
            editor_ports: PortRange::new(48800, 48820),
            session_expiry: Duration::from_secs(3600),
            secure_cookies: false,
            state_dir,
            api_rate_limit: 60,
            api_rate_window: Duration::from_secs(60),
            trust_proxy_headers: true,
            ready_timeout: Duration::from_millis(200),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        serve: ServeArgs,
    }

    fn parse(args: &[&str]) -> ServeArgs {
        let mut argv = vec!["termgate"];
        argv.extend_from_slice(args);
        Harness::parse_from(argv).serve
    }

    #[test]
    fn test_default_port() {
        let args = parse(&[]);
        assert_eq!(args.port, 7680);
        assert_eq!(args.host, "127.0.0.1");
    }

    #[test]
    fn test_default_ranges_are_disjoint() {
        let args = parse(&["--state-dir", "/tmp/termgate"]);
        let config = GatewayConfig::from_args(args).unwrap();
        assert!(!config.terminal_ports.overlaps(&config.editor_ports));
        assert!(config.secure_cookies);
    }

    #[test]
    fn test_insecure_cookie_flag() {
        let args = parse(&["--insecure-cookies", "--state-dir", "/tmp/termgate"]);
        let config = GatewayConfig::from_args(args).unwrap();
        assert!(!config.secure_cookies);
    }

    #[test]
    fn test_trust_proxy_headers_can_be_disabled() {
        let args = parse(&["--trust-proxy-headers", "false"]);
        assert!(!args.trust_proxy_headers);
    }

    #[test]
    fn test_overlapping_ranges_rejected() {
        let args = parse(&[
            "--terminal-ports",
            "9000-9100",
            "--editor-ports",
            "9050-9150",
            "--state-dir",
            "/tmp/termgate",
        ]);
        assert!(GatewayConfig::from_args(args).is_err());
    }

    #[test]
    fn test_listen_port_inside_range_rejected() {
        let args = parse(&["--port", "7690", "--state-dir", "/tmp/termgate"]);
        assert!(GatewayConfig::from_args(args).is_err());
    }

    #[test]
    fn test_port_range_parse() {
        assert_eq!("10-20".parse::<PortRange>().unwrap(), PortRange::new(10, 20));
        assert!("20-10".parse::<PortRange>().is_err());
        assert!("abc".parse::<PortRange>().is_err());
        assert!("0-10".parse::<PortRange>().is_err());
    }
}

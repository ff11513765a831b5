use std::path::PathBuf;
use std::time::Duration;

/// Application configuration.
///
/// Built once at startup from the parsed CLI and shared read-only with the
/// controller, executor and reporter.
pub struct Config {
    // MQTT
    pub mqtt_host: String,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    pub shutdown_topic: String,
    pub shutdown_payload: String,
    pub report_topic: String,

    // SSH
    pub ssh_host: String,
    pub ssh_username: String,
    pub ssh_password: Option<String>,
    pub ssh_key_file: Option<PathBuf>,
    pub ssh_host_fingerprint: Option<String>,

    // Parameters for the shutdown script
    pub esxi_ip: String,
    pub esxi_username: String,
    pub esxi_password: Option<String>,
    pub esxi_timeout: String,
    pub esxi_vm_to_skip: Option<String>,

    pub script_path: PathBuf,
    pub remote_script_path: String,
    pub script_interpreter: Option<String>,

    pub countdown: Duration,
    pub send_timeout: Duration,
    pub ssh_connect_timeout: Duration,
    pub ssh_command_timeout: Duration,
    pub reconnect_delay_secs: u64,
    pub reconnect_max_delay_secs: u64,

    pub mqtt_port: u16,
    pub ssh_port: u16,

    pub report_failures: bool,
    pub notify_systemd: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("mqtt_host", &self.mqtt_host)
            .field("mqtt_port", &self.mqtt_port)
            .field("mqtt_username", &self.mqtt_username)
            .field("mqtt_password", &"<redacted>")
            .field("mqtt_client_id", &self.mqtt_client_id)
            .field("shutdown_topic", &self.shutdown_topic)
            .field("report_topic", &self.report_topic)
            .field("countdown", &self.countdown)
            .field("ssh_host", &self.ssh_host)
            .field("ssh_port", &self.ssh_port)
            .field("ssh_username", &self.ssh_username)
            .field("ssh_password", &"<redacted>")
            .field("esxi_ip", &self.esxi_ip)
            .field("esxi_username", &self.esxi_username)
            .field("esxi_password", &"<redacted>")
            .field("esxi_vm_to_skip", &self.esxi_vm_to_skip)
            .field("script_path", &self.script_path)
            .field("remote_script_path", &self.remote_script_path)
            .finish_non_exhaustive()
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Default MQTT client id, unique per machine and account so two daemons on
/// one broker don't kick each other off.
fn default_client_id() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    format!("VMwareAutoShutdown-{host}-{user}")
}

impl Config {
    pub fn from_cli(cli: crate::cli::Cli) -> anyhow::Result<Self> {
        if cli.timeout_seconds == 0 {
            anyhow::bail!("--timeout-seconds must be greater than zero");
        }
        if cli.ssh_command_timeout == 0 {
            anyhow::bail!("--ssh-command-timeout must be greater than zero");
        }
        if cli.send_timeout_secs == 0 {
            anyhow::bail!("--send-timeout-secs must be greater than zero");
        }
        if cli.shutdown_topic.is_empty() || cli.report_topic.is_empty() {
            anyhow::bail!("MQTT topics must not be empty");
        }
        if cli.shutdown_topic == cli.report_topic {
            anyhow::bail!(
                "Shutdown topic and report topic must differ (both are '{}')",
                cli.shutdown_topic
            );
        }

        let script_path = expand_tilde(&cli.script_path);
        if !script_path.is_file() {
            anyhow::bail!("Shutdown script not found: {}", script_path.display());
        }

        let ssh_key_file = cli.ssh_key_file.as_deref().map(expand_tilde);
        let ssh_password = cli.ssh_password.or_else(|| cli.esxi_password.clone());
        if ssh_key_file.is_none() && ssh_password.is_none() {
            anyhow::bail!("SSH needs either a password (SSH_PASSWORD / ESXI_PASSWORD) or SSH_KEY_FILE");
        }

        let mqtt_username = cli.mqtt_username.filter(|u| !u.is_empty());

        Ok(Self {
            mqtt_host: cli.mqtt_host,
            mqtt_port: cli.mqtt_port,
            mqtt_password: mqtt_username.as_ref().and(cli.mqtt_password),
            mqtt_username,
            mqtt_client_id: cli.mqtt_client_id.unwrap_or_else(default_client_id),
            shutdown_topic: cli.shutdown_topic,
            shutdown_payload: cli.shutdown_payload,
            report_topic: cli.report_topic,
            ssh_host: cli.ssh_host.unwrap_or_else(|| cli.esxi_ip.clone()),
            ssh_port: cli.ssh_port,
            ssh_username: cli.ssh_username.unwrap_or_else(|| cli.esxi_username.clone()),
            ssh_password,
            ssh_key_file,
            ssh_host_fingerprint: cli.ssh_host_fingerprint,
            esxi_ip: cli.esxi_ip,
            esxi_username: cli.esxi_username,
            esxi_password: cli.esxi_password,
            esxi_timeout: cli.esxi_timeout,
            esxi_vm_to_skip: cli.esxi_vm_to_skip,
            script_path,
            remote_script_path: cli.remote_script_path,
            script_interpreter: cli.script_interpreter.filter(|i| !i.trim().is_empty()),
            countdown: Duration::from_secs(cli.timeout_seconds),
            send_timeout: Duration::from_secs(cli.send_timeout_secs),
            ssh_connect_timeout: Duration::from_secs(cli.ssh_connect_timeout),
            ssh_command_timeout: Duration::from_secs(cli.ssh_command_timeout),
            reconnect_delay_secs: cli.reconnect_delay,
            reconnect_max_delay_secs: cli.reconnect_max_delay,
            report_failures: cli.report_failures,
            notify_systemd: cli.notify_systemd,
        })
    }
}

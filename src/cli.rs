use clap::Parser;
use crate::types::*;

#[derive(Parser, Debug)]
#[command(
    name = "vmware-autoshutdown",
    about = "Shut down a VMware host when a countdown triggered over MQTT expires"
)]
pub struct Cli {
    /// MQTT broker host
    #[arg(long, env = "MQTT_HOST", default_value = "127.0.0.1")]
    pub mqtt_host: String,

    /// MQTT broker port
    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    pub mqtt_port: u16,

    /// MQTT username (anonymous when omitted)
    #[arg(long, env = "MQTT_USERNAME")]
    pub mqtt_username: Option<String>,

    /// MQTT password.
    /// Prefer the MQTT_PASSWORD environment variable over the flag.
    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    pub mqtt_password: Option<String>,

    /// MQTT client id (default: VMwareAutoShutdown-<hostname>-<user>)
    #[arg(long, env = "MQTT_CLIENT_ID")]
    pub mqtt_client_id: Option<String>,

    /// Topic carrying the shutdown trigger
    #[arg(long, env = "MQTT_SHUTDOWN_TOPIC", default_value = "bluewalk/shutdown")]
    pub shutdown_topic: String,

    /// Payload on the trigger topic that arms the countdown (case-insensitive)
    #[arg(long, env = "MQTT_SHUTDOWN_PAYLOAD", default_value = "yes")]
    pub shutdown_payload: String,

    /// Topic receiving status events
    #[arg(long, env = "MQTT_REPORT_TOPIC", default_value = "bluewalk/shutdown/report")]
    pub report_topic: String,

    /// Seconds between arming the countdown and starting the shutdown
    #[arg(long, env = "TIMEOUT_SECONDS", default_value_t = 300)]
    pub timeout_seconds: u64,

    /// Upper bound in seconds for publishing a status event
    #[arg(long, env = "MQTT_SEND_TIMEOUT", default_value_t = 5)]
    pub send_timeout_secs: u64,

    /// Base delay in seconds between broker reconnect attempts
    #[arg(long, env = "MQTT_RECONNECT_DELAY", default_value_t = 5)]
    pub reconnect_delay: u64,

    /// Maximum delay in seconds between broker reconnect attempts
    #[arg(long, env = "MQTT_RECONNECT_MAX_DELAY", default_value_t = 60)]
    pub reconnect_max_delay: u64,

    /// SSH host running the shutdown script (default: the ESXi address)
    #[arg(long, env = "SSH_HOST")]
    pub ssh_host: Option<String>,

    /// SSH port
    #[arg(long, env = "SSH_PORT", default_value_t = 22)]
    pub ssh_port: u16,

    /// SSH username (default: the ESXi username)
    #[arg(long, env = "SSH_USERNAME")]
    pub ssh_username: Option<String>,

    /// SSH password (default: the ESXi password)
    #[arg(long, env = "SSH_PASSWORD", hide_env_values = true)]
    pub ssh_password: Option<String>,

    /// Private key used for SSH authentication instead of a password
    #[arg(long, env = "SSH_KEY_FILE")]
    pub ssh_key_file: Option<String>,

    /// Expected SHA256 fingerprint of the SSH host key
    #[arg(long, env = "SSH_HOST_FINGERPRINT")]
    pub ssh_host_fingerprint: Option<String>,

    /// Seconds allowed for the SSH connection and authentication
    #[arg(long, env = "SSH_CONNECT_TIMEOUT", default_value_t = 30)]
    pub ssh_connect_timeout: u64,

    /// Seconds allowed for each remote step (upload, script run) once connected
    #[arg(long, env = "SSH_COMMAND_TIMEOUT", default_value_t = 900)]
    pub ssh_command_timeout: u64,

    /// ESXi host address handed to the shutdown script
    #[arg(long, env = "ESXI_IP")]
    pub esxi_ip: String,

    /// ESXi username handed to the shutdown script
    #[arg(long, env = "ESXI_USERNAME")]
    pub esxi_username: String,

    /// ESXi password handed to the shutdown script
    #[arg(long, env = "ESXI_PASSWORD", hide_env_values = true)]
    pub esxi_password: Option<String>,

    /// ESXi connection timeout handed to the shutdown script
    #[arg(long, env = "ESXI_TIMEOUT", default_value = "300")]
    pub esxi_timeout: String,

    /// Name of a VM the shutdown script must leave running
    #[arg(long, env = "ESXI_VMTOSKIP")]
    pub esxi_vm_to_skip: Option<String>,

    /// Local shutdown script uploaded to the SSH host
    #[arg(long = "script", env = "SHUTDOWN_SCRIPT", default_value = "shutdown.ps1")]
    pub script_path: String,

    /// Remote staging path for the uploaded script
    #[arg(long, env = "REMOTE_SCRIPT_PATH", default_value = "/tmp/vmware-autoshutdown.ps1")]
    pub remote_script_path: String,

    /// Interpreter used to run the script (e.g. "pwsh -File")
    #[arg(long, env = "SCRIPT_INTERPRETER")]
    pub script_interpreter: Option<String>,

    /// Publish SHUTDOWN_FAILED when a shutdown run fails
    #[arg(long, env = "REPORT_FAILURES")]
    pub report_failures: bool,

    /// Send sd_notify READY/STOPPING/STATUS messages
    #[arg(long)]
    pub notify_systemd: bool,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,
}

//! The safety gate in front of command execution.
//!
//! Deterministic, order-fixed checks: length caps, byte-level screening,
//! the deny catalog, then the allow-list of base commands. Deny is
//! checked before allow. Scripts get the deny catalog plus extra
//! patterns but no allow-list. Rejection is a structured error and has
//! no side effects.

use std::collections::HashSet;

use regex::RegexSet;

/// Commands above this length are rejected outright.
pub const MAX_COMMAND_LEN: usize = 10_000;

/// Script bodies above this length are rejected outright.
pub const MAX_SCRIPT_LEN: usize = 1_048_576;

/// Case-insensitive deny patterns applied to commands and scripts alike.
const DENY_PATTERNS: &[&str] = &[
    // Destructive storage operations.
    r"rm\s+(-\w+\s+)*-\w*r\w*\s+/(\s|$|\*)",
    r"rm\s+.*--no-preserve-root",
    r"dd\s+.*of=/dev/(sd|hd|nvme|vd|disk)",
    r"mkfs(\.\w+)?\s",
    r"\bformat\s+[a-z]:",
    r"wipefs\s",
    r"shred\s+.*/dev/",
    // User and credential changes.
    r"\b(useradd|userdel|usermod|chpasswd)\b",
    // `passwd` as an invoked command, not the word inside /etc/passwd.
    r"(^|[;&|]\s*|\b(sudo|doas)\s+)passwd(\s|$)",
    r"net\s+user\s+\S+\s+\S+",
    r"net\s+localgroup\s+administrators",
    // Firewall teardown.
    r"netsh\s+.*firewall.*(off|disable)",
    r"\bufw\s+disable",
    r"systemctl\s+(stop|disable)\s+(firewalld|ufw|nftables)",
    r"iptables\s+(-F|--flush)",
    // Security-product tampering.
    r"set-mppreference\s+.*-disable",
    r"sc\s+(stop|config)\s+(windefend|sense|wscsvc)",
    r"taskkill\s+.*(msmpeng|defender)",
    // Download-then-execute pipelines.
    r"(curl|wget|invoke-webrequest|iwr)\b[^|;&]*\|\s*(sh|bash|zsh|dash|powershell|pwsh|iex)\b",
    r"downloadstring\s*\(.*\)\s*.*\biex\b",
    r"\biex\b.*downloadstring",
    r"certutil\s+.*-urlcache",
    // Registry deletion under HKLM.
    r"reg\s+delete\s+.*hklm",
    r"remove-item\s+.*hklm:",
    // Known credential-theft tooling.
    r"\b(mimikatz|lazagne|pwdump|gsecdump|secretsdump)\b",
    r"procdump\s+.*lsass",
];

/// Extra deny patterns applied to script bodies only.
const SCRIPT_DENY_PATTERNS: &[&str] = &[
    // Ransomware indicators.
    r"vssadmin\s+delete\s+shadows",
    r"bcdedit\s+/set\s+.*recoveryenabled\s+no",
    r"wbadmin\s+delete\s+catalog",
    r"cipher\s+/w",
    // Persistence registration.
    r"schtasks\s+/create",
    r"reg\s+add\s+.*currentversion\\+run",
    r"new-itemproperty\s+.*currentversion\\+run",
    r"crontab\s+-e",
    r">>\s*/etc/cron",
    // Credential dumping references.
    r"sekurlsa",
    r"lsadump",
    r"hashdump",
];

/// Tokens stripped before resolving the base command.
const ELEVATION_TOKENS: &[&str] = &["sudo", "doas", "runas"];

/// Base commands allowed for `execute_command`: system query tools,
/// read-only file tools, network diagnostics, and read-only PowerShell
/// cmdlets.
const ALLOWED_BASE_COMMANDS: &[&str] = &[
    // System query.
    "uname", "whoami", "hostname", "uptime", "date", "id", "env", "printenv", "ver", "systeminfo",
    "df", "du", "free", "ps", "top", "vmstat", "iostat", "lscpu", "lsblk", "lsusb", "lspci",
    "sysctl", "ulimit", "w", "who", "last", "dmesg", "journalctl", "tasklist", "wmic",
    // Read-only file tools.
    "ls", "dir", "cat", "type", "head", "tail", "less", "more", "find", "grep", "egrep", "fgrep",
    "stat", "file", "wc", "which", "where", "readlink", "realpath", "md5sum", "sha256sum", "pwd",
    "tree", "basename", "dirname", "echo",
    // Network diagnostics.
    "ping", "traceroute", "tracert", "nslookup", "dig", "host", "netstat", "ss", "ip", "ifconfig",
    "ipconfig", "arp", "route", "curl", "wget", "nc", "telnet", "mtr", "whois",
    // Read-only PowerShell cmdlets.
    "get-process", "get-service", "get-eventlog", "get-winevent", "get-childitem", "get-content",
    "get-item", "get-itemproperty", "get-date", "get-host", "get-uptime", "get-computerinfo",
    "get-wmiobject", "get-ciminstance", "get-netipaddress", "get-netadapter", "get-disk",
    "get-volume", "get-psdrive", "test-connection", "test-path", "test-netconnection",
    "resolve-dnsname", "measure-object", "select-object", "sort-object", "where-object",
];

/// Why a command or script was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("command exceeds {MAX_COMMAND_LEN} characters")]
    CommandTooLong,
    #[error("script exceeds {MAX_SCRIPT_LEN} bytes")]
    ScriptTooLong,
    #[error("input contains a NUL byte")]
    NulByte,
    #[error("input contains a non-whitespace control character")]
    ControlCharacter,
    #[error("input contains a bidirectional-override code point")]
    BidiOverride,
    #[error("matched deny pattern: {0}")]
    Denied(String),
    #[error("base command '{0}' is not on the allow list")]
    NotAllowed(String),
}

/// Compiled validator. Built once at startup; all checks are pure.
pub struct Validator {
    deny: RegexSet,
    script_deny: RegexSet,
    allowed: HashSet<&'static str>,
}

impl Validator {
    pub fn new() -> Self {
        let deny = RegexSet::new(DENY_PATTERNS.iter().map(|p| format!("(?i){p}")))
            .expect("deny catalog must compile");
        let script_deny = RegexSet::new(
            DENY_PATTERNS
                .iter()
                .chain(SCRIPT_DENY_PATTERNS.iter())
                .map(|p| format!("(?i){p}")),
        )
        .expect("script deny catalog must compile");
        Self {
            deny,
            script_deny,
            allowed: ALLOWED_BASE_COMMANDS.iter().copied().collect(),
        }
    }

    /// Gate a one-line command for `execute_command`.
    pub fn validate_command(&self, command: &str) -> Result<(), ValidationError> {
        if command.chars().count() > MAX_COMMAND_LEN {
            return Err(ValidationError::CommandTooLong);
        }
        screen_bytes(command)?;

        if let Some(index) = self.deny.matches(command).iter().next() {
            return Err(ValidationError::Denied(DENY_PATTERNS[index].to_string()));
        }

        for base in base_commands(command) {
            if !self.allowed.contains(base.as_str()) {
                return Err(ValidationError::NotAllowed(base));
            }
        }
        Ok(())
    }

    /// Gate a script body for `execute_script`.
    pub fn validate_script(&self, body: &str) -> Result<(), ValidationError> {
        if body.len() > MAX_SCRIPT_LEN {
            return Err(ValidationError::ScriptTooLong);
        }
        screen_bytes(body)?;

        if let Some(index) = self.script_deny.matches(body).iter().next() {
            let all: Vec<&str> = DENY_PATTERNS
                .iter()
                .chain(SCRIPT_DENY_PATTERNS.iter())
                .copied()
                .collect();
            return Err(ValidationError::Denied(all[index].to_string()));
        }
        Ok(())
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

/// NUL bytes, non-whitespace control characters, and bidi overrides are
/// rejected before any pattern matching.
fn screen_bytes(input: &str) -> Result<(), ValidationError> {
    for ch in input.chars() {
        if ch == '\0' {
            return Err(ValidationError::NulByte);
        }
        if ch.is_control() && !ch.is_whitespace() {
            return Err(ValidationError::ControlCharacter);
        }
        if ('\u{202A}'..='\u{202E}').contains(&ch) {
            return Err(ValidationError::BidiOverride);
        }
    }
    Ok(())
}

/// Every base command in a chained/piped command line, lowercased, with
/// leading elevation tokens, paths, and `.exe` suffixes stripped.
fn base_commands(command: &str) -> Vec<String> {
    command
        .split(['|', ';', '\n'])
        .flat_map(|segment| segment.split("&&"))
        .flat_map(|segment| segment.split("||"))
        .filter_map(|segment| {
            let mut tokens = segment.split_whitespace();
            let mut first = tokens.next()?;
            while ELEVATION_TOKENS.contains(&first.to_ascii_lowercase().as_str()) {
                first = tokens.next()?;
            }
            let name = first
                .rsplit(['/', '\\'])
                .next()
                .unwrap_or(first)
                .to_ascii_lowercase();
            Some(name.trim_end_matches(".exe").to_string())
        })
        .collect()
}

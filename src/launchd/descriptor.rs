//! launchd job descriptor (.plist)

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Restart policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeepAlive {
    Always(bool),
    Conditions {
        #[serde(rename = "SuccessfulExit", default, skip_serializing_if = "Option::is_none")]
        successful_exit: Option<bool>,
    },
}

/// The subset of launchd.plist(5) keys used for PostgreSQL servers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DaemonDescriptor {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub program_arguments: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub run_at_load: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_alive: Option<KeepAlive>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standard_out_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standard_error_path: Option<String>,
}

impl DaemonDescriptor {
    pub fn from_file(path: &Path) -> Result<Self, plist::Error> {
        plist::from_file(path)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, plist::Error> {
        plist::from_bytes(bytes)
    }

    pub fn to_xml(&self) -> Result<Vec<u8>, plist::Error> {
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, self)?;
        Ok(buf)
    }

    /// Build from a dictionary reported by `launchctl list <label>`
    pub fn from_dictionary(dict: &plist::Dictionary) -> Option<Self> {
        let string = |key: &str| dict.get(key).and_then(|v| v.as_string()).map(String::from);
        let keep_alive = match dict.get("KeepAlive") {
            Some(plist::Value::Boolean(b)) => Some(KeepAlive::Always(*b)),
            Some(plist::Value::Dictionary(d)) => Some(KeepAlive::Conditions {
                successful_exit: d.get("SuccessfulExit").and_then(|v| v.as_boolean()),
            }),
            _ => None,
        };
        // launchctl reports OnDemand = !KeepAlive for legacy jobs
        let keep_alive = keep_alive.or_else(|| {
            dict.get("OnDemand")
                .and_then(|v| v.as_boolean())
                .filter(|on_demand| !on_demand)
                .map(|_| KeepAlive::Always(true))
        });

        Some(Self {
            label: string("Label")?,
            program: string("Program"),
            program_arguments: dict
                .get("ProgramArguments")
                .and_then(|v| v.as_array())
                .map(|a| a.iter().filter_map(|v| v.as_string().map(String::from)).collect())
                .unwrap_or_default(),
            user_name: string("UserName"),
            working_directory: string("WorkingDirectory"),
            run_at_load: dict.get("RunAtLoad").and_then(|v| v.as_boolean()).unwrap_or(false),
            keep_alive,
            standard_out_path: string("StandardOutPath"),
            standard_error_path: string("StandardErrorPath"),
        })
    }

    /// The executable launchd will run
    pub fn executable(&self) -> Option<&str> {
        self.program
            .as_deref()
            .or_else(|| self.program_arguments.first().map(String::as_str))
    }

    /// Value following `flag` in the program arguments
    pub fn argument(&self, flag: &str) -> Option<&str> {
        self.program_arguments
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.program_arguments.get(i + 1))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DaemonDescriptor {
        DaemonDescriptor {
            label: "org.postgresql.preferences.pg1".into(),
            program: None,
            program_arguments: vec![
                "/usr/local/bin/postgres".into(),
                "-D".into(),
                "/usr/local/pgsql/data".into(),
                "-p".into(),
                "5432".into(),
            ],
            user_name: Some("postgres".into()),
            working_directory: Some("/usr/local/pgsql/data".into()),
            run_at_load: true,
            keep_alive: Some(KeepAlive::Conditions {
                successful_exit: Some(false),
            }),
            standard_out_path: Some("/tmp/pg1.log".into()),
            standard_error_path: Some("/tmp/pg1.log".into()),
        }
    }

    #[test]
    fn test_xml_uses_launchd_keys() {
        let xml = String::from_utf8(sample().to_xml().unwrap()).unwrap();
        assert!(xml.contains("<key>Label</key>"));
        assert!(xml.contains("<key>ProgramArguments</key>"));
        assert!(xml.contains("<key>RunAtLoad</key>"));
        assert!(xml.contains("<key>SuccessfulExit</key>"));
        assert!(xml.contains("<key>StandardErrorPath</key>"));
        assert!(!xml.contains("<key>Program</key>"));
    }

    #[test]
    fn test_xml_roundtrip() {
        let descriptor = sample();
        let parsed = DaemonDescriptor::from_bytes(&descriptor.to_xml().unwrap()).unwrap();
        assert_eq!(parsed, descriptor);
    }

    #[test]
    fn test_reads_foreign_plist() {
        let xml = br#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key><string>homebrew.mxcl.postgresql</string>
    <key>ProgramArguments</key>
    <array>
        <string>/usr/local/opt/postgresql/bin/postgres</string>
        <string>-D</string>
        <string>/usr/local/var/postgres</string>
    </array>
    <key>KeepAlive</key><true/>
    <key>LimitLoadToSessionType</key><string>Aqua</string>
</dict>
</plist>"#;
        let d = DaemonDescriptor::from_bytes(xml).unwrap();
        assert_eq!(d.label, "homebrew.mxcl.postgresql");
        assert_eq!(d.keep_alive, Some(KeepAlive::Always(true)));
        assert!(!d.run_at_load);
        assert_eq!(d.argument("-D"), Some("/usr/local/var/postgres"));
        assert_eq!(d.argument("-p"), None);
        assert_eq!(d.executable(), Some("/usr/local/opt/postgresql/bin/postgres"));
    }
}

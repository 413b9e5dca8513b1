//! Deterministic machine fingerprint for license binding.
//!
//! Hashes stable host attributes (hostname, primary MAC, OS, architecture,
//! and the machine id where readable) into a 24-hex-char identifier. The
//! value is stable across reboots on the same hardware; components that
//! cannot be read contribute an empty string so the hash stays
//! deterministic on that host.

use sha2::{Digest, Sha256};

/// Length of the rendered fingerprint.
pub const FINGERPRINT_LEN: usize = 24;

/// Compute this host's fingerprint.
pub fn machine_fingerprint() -> String {
    fingerprint_from_parts(&[
        &hostname(),
        &primary_mac(),
        std::env::consts::OS,
        std::env::consts::ARCH,
        &machine_id(),
    ])
}

fn fingerprint_from_parts(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        // Separator so ("ab","c") and ("a","bc") differ.
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(FINGERPRINT_LEN);
    for byte in digest.iter() {
        if hex.len() >= FINGERPRINT_LEN {
            break;
        }
        hex.push_str(&format!("{byte:02x}"));
    }
    hex.truncate(FINGERPRINT_LEN);
    hex
}

fn hostname() -> String {
    for path in ["/proc/sys/kernel/hostname", "/etc/hostname"] {
        if let Ok(name) = std::fs::read_to_string(path) {
            let name = name.trim();
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_default()
}

/// First (lexicographically) non-loopback interface's MAC. Sorting makes
/// the choice independent of kernel enumeration order.
fn primary_mac() -> String {
    let Ok(entries) = std::fs::read_dir("/sys/class/net") else {
        return String::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name != "lo")
        .collect();
    names.sort();

    for name in names {
        if let Ok(addr) = std::fs::read_to_string(format!("/sys/class/net/{name}/address")) {
            let addr = addr.trim();
            if !addr.is_empty() && addr != "00:00:00:00:00:00" {
                return addr.to_string();
            }
        }
    }
    String::new()
}

fn machine_id() -> String {
    for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
        if let Ok(id) = std::fs::read_to_string(path) {
            let id = id.trim();
            if !id.is_empty() {
                return id.to_string();
            }
        }
    }
    String::new()
}

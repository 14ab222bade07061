//! MITRE ATT&CK technique mapping (C8).
//!
//! `TECHNIQUE_DB` is the same table the original `mitre_mapping.py` shipped:
//! roughly four dozen techniques spanning twelve tactics, each with a short
//! keyword list used for the second-pass keyword scan.

use crate::models::{IoCBundle, MitreSource, MitreTechnique};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

struct TechniqueDef {
    id: &'static str,
    name: &'static str,
    tactic: &'static str,
    keywords: &'static [&'static str],
}

macro_rules! technique {
    ($id:expr, $name:expr, $tactic:expr, [$($kw:expr),* $(,)?]) => {
        TechniqueDef { id: $id, name: $name, tactic: $tactic, keywords: &[$($kw),*] }
    };
}

const TECHNIQUE_DB: &[TechniqueDef] = &[
    // Initial Access
    technique!("T1566", "Phishing", "initial_access", ["phishing", "spear-phishing", "email attachment", "malicious link"]),
    technique!("T1566.001", "Spearphishing Attachment", "initial_access", ["attachment", "doc", "xls", "macro", "office"]),
    technique!("T1566.002", "Spearphishing Link", "initial_access", ["link", "url", "click"]),
    technique!("T1190", "Exploit Public-Facing Application", "initial_access", ["exploit", "vulnerability", "cve", "rce"]),
    technique!("T1133", "External Remote Services", "initial_access", ["vpn", "rdp", "remote desktop", "citrix"]),
    technique!("T1195", "Supply Chain Compromise", "initial_access", ["supply chain", "trojanized", "update", "package"]),
    // Execution
    technique!("T1059", "Command and Scripting Interpreter", "execution", ["script", "interpreter"]),
    technique!("T1059.001", "PowerShell", "execution", ["powershell", "ps1", "invoke-expression", "iex", "-encodedcommand", "-enc"]),
    technique!("T1059.003", "Windows Command Shell", "execution", ["cmd.exe", "cmd /c", "command prompt", "batch"]),
    technique!("T1059.005", "Visual Basic", "execution", ["vbscript", "vbs", "wscript", "cscript", "macro"]),
    technique!("T1059.007", "JavaScript", "execution", ["javascript", "jscript", "js", "node"]),
    technique!("T1204", "User Execution", "execution", ["user execution", "double click", "open", "run"]),
    technique!("T1047", "Windows Management Instrumentation", "execution", ["wmi", "wmic", "wmiprvse"]),
    technique!("T1053", "Scheduled Task/Job", "execution", ["schtasks", "scheduled task", "cron", "at.exe"]),
    // Persistence
    technique!("T1547.001", "Registry Run Keys / Startup Folder", "persistence", ["run key", "startup", "hkcu\\software\\microsoft\\windows\\currentversion\\run", "autorun"]),
    technique!("T1543.003", "Windows Service", "persistence", ["service", "sc.exe", "new-service"]),
    technique!("T1136", "Create Account", "persistence", ["net user", "create account", "add user"]),
    technique!("T1505.003", "Web Shell", "persistence", ["webshell", "web shell", "aspx", "jsp"]),
    // Privilege Escalation
    technique!("T1548.002", "Bypass UAC", "privilege_escalation", ["uac", "bypass", "eventvwr", "fodhelper"]),
    technique!("T1068", "Exploitation for Privilege Escalation", "privilege_escalation", ["privilege escalation", "local exploit", "kernel exploit"]),
    // Defense Evasion
    technique!("T1027", "Obfuscated Files or Information", "defense_evasion", ["obfuscated", "encoded", "base64", "encryption", "packed"]),
    technique!("T1036", "Masquerading", "defense_evasion", ["masquerad", "renamed", "disguised", "legitimate"]),
    technique!("T1070", "Indicator Removal", "defense_evasion", ["clear logs", "delete logs", "wevtutil", "indicator removal"]),
    technique!("T1562.001", "Disable or Modify Tools", "defense_evasion", ["disable defender", "tamper protection", "disable antivirus", "kill av"]),
    technique!("T1055", "Process Injection", "defense_evasion", ["inject", "process injection", "dll injection", "hollowing", "createremotethread"]),
    technique!("T1218", "System Binary Proxy Execution", "defense_evasion", ["mshta", "rundll32", "regsvr32", "certutil", "lolbin"]),
    // Credential Access
    technique!("T1003", "OS Credential Dumping", "credential_access", ["credential dump", "lsass", "mimikatz", "procdump", "ntds"]),
    technique!("T1003.001", "LSASS Memory", "credential_access", ["lsass", "mimikatz", "sekurlsa"]),
    technique!("T1110", "Brute Force", "credential_access", ["brute force", "password spray", "credential stuffing"]),
    technique!("T1552", "Unsecured Credentials", "credential_access", ["plaintext password", "credentials in files", "password file"]),
    // Discovery
    technique!("T1082", "System Information Discovery", "discovery", ["systeminfo", "hostname", "ver", "system information"]),
    technique!("T1083", "File and Directory Discovery", "discovery", ["dir", "find", "ls", "file listing"]),
    technique!("T1087", "Account Discovery", "discovery", ["net user", "net group", "whoami", "account discovery"]),
    technique!("T1057", "Process Discovery", "discovery", ["tasklist", "ps", "get-process", "process list"]),
    technique!("T1049", "System Network Connections Discovery", "discovery", ["netstat", "ss", "network connections"]),
    // Lateral Movement
    technique!("T1021.001", "Remote Desktop Protocol", "lateral_movement", ["rdp", "mstsc", "remote desktop", "3389"]),
    technique!("T1021.002", "SMB/Windows Admin Shares", "lateral_movement", ["smb", "admin$", "c$", "ipc$", "net use"]),
    technique!("T1570", "Lateral Tool Transfer", "lateral_movement", ["copy", "transfer", "move laterally", "psexec"]),
    // Collection
    technique!("T1005", "Data from Local System", "collection", ["collect data", "local files", "sensitive data"]),
    technique!("T1113", "Screen Capture", "collection", ["screenshot", "screen capture", "screen grab"]),
    technique!("T1056.001", "Keylogging", "collection", ["keylogger", "keylogging", "keystroke"]),
    // Command and Control
    technique!("T1071", "Application Layer Protocol", "command_and_control", ["http", "https", "dns", "c2", "command and control"]),
    technique!("T1071.001", "Web Protocols", "command_and_control", ["http beacon", "https callback", "web c2"]),
    technique!("T1071.004", "DNS", "command_and_control", ["dns tunnel", "dns c2", "dns exfiltration"]),
    technique!("T1105", "Ingress Tool Transfer", "command_and_control", ["download", "wget", "curl", "certutil", "bitsadmin"]),
    technique!("T1572", "Protocol Tunneling", "command_and_control", ["tunnel", "ssh tunnel", "vpn tunnel", "socks"]),
    technique!("T1573", "Encrypted Channel", "command_and_control", ["encrypted", "ssl", "tls", "encrypted c2"]),
    // Exfiltration
    technique!("T1041", "Exfiltration Over C2 Channel", "exfiltration", ["exfiltrate", "data theft", "steal data"]),
    technique!("T1048", "Exfiltration Over Alternative Protocol", "exfiltration", ["ftp exfil", "dns exfil", "icmp exfil"]),
    technique!("T1567", "Exfiltration Over Web Service", "exfiltration", ["cloud storage", "dropbox", "google drive", "mega"]),
    // Impact
    technique!("T1486", "Data Encrypted for Impact", "impact", ["ransomware", "encrypt", "ransom", "locked files"]),
    technique!("T1490", "Inhibit System Recovery", "impact", ["vssadmin", "shadow copy", "bcdedit", "wbadmin"]),
    technique!("T1489", "Service Stop", "impact", ["stop service", "net stop", "sc stop", "taskkill"]),
];

fn technique_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"T\d{4}(?:\.\d{3})?").unwrap())
}

fn lookup(id: &str) -> Option<&'static TechniqueDef> {
    TECHNIQUE_DB.iter().find(|t| t.id == id)
}

/// Two-phase mapping (§11.1): AI-extracted TTPs first, at fixed confidence
/// 0.95, then a keyword scan over IoCs/threat actors/tools for anything not
/// already matched, scored at `min(0.9, 0.3 + hits * 0.15)`.
pub fn map_iocs_to_mitre(bundle: &IoCBundle) -> Vec<MitreTechnique> {
    let mut matches = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for ttp in &bundle.ttps {
        let upper = ttp.mitre_id.to_uppercase();
        for m in technique_id_re().find_iter(&upper) {
            let tid = m.as_str();
            if seen.contains(tid) {
                continue;
            }
            if let Some(tech) = lookup(tid) {
                seen.insert(tid.to_string());
                let description = if ttp.description.is_empty() {
                    format!("AI identified {} technique used in this attack.", tech.name)
                } else {
                    ttp.description.clone()
                };
                matches.push(MitreTechnique {
                    technique_id: tid.to_string(),
                    technique_name: tech.name.to_string(),
                    tactic: tech.tactic.to_string(),
                    confidence: 0.95,
                    source: MitreSource::AiExtracted,
                    description,
                });
            }
        }
    }

    let mut text_parts = Vec::new();
    for category_values in bundle.indicators_of_compromise.values() {
        text_parts.extend(category_values.iter().map(|s| s.to_lowercase()));
    }
    text_parts.extend(bundle.threat_actors.iter().map(|s| s.to_lowercase()));
    text_parts.extend(bundle.tools_or_malware.iter().map(|s| s.to_lowercase()));
    let combined_text = text_parts.join(" ");

    for tech in TECHNIQUE_DB {
        if seen.contains(tech.id) {
            continue;
        }
        let matched_kws: Vec<&str> = tech
            .keywords
            .iter()
            .copied()
            .filter(|kw| combined_text.contains(kw))
            .collect();
        let hits = matched_kws.len();
        if hits > 0 {
            seen.insert(tech.id.to_string());
            let confidence = (0.3 + hits as f64 * 0.15).min(0.9);
            let confidence = (confidence * 100.0).round() / 100.0;
            let evidence = matched_kws.iter().take(5).cloned().collect::<Vec<_>>().join(", ");
            matches.push(MitreTechnique {
                technique_id: tech.id.to_string(),
                technique_name: tech.name.to_string(),
                tactic: tech.tactic.to_string(),
                confidence,
                source: MitreSource::KeywordMatch,
                description: format!("Detected via keyword indicators: {evidence}"),
            });
        }
    }

    matches.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap());
    matches
}

pub fn get_mitre_tags(techniques: &[MitreTechnique]) -> Vec<String> {
    let mut tags = std::collections::BTreeSet::new();
    for tech in techniques {
        if !tech.tactic.is_empty() {
            tags.insert(format!("attack.{}", tech.tactic));
        }
        if !tech.technique_id.is_empty() {
            tags.insert(format!("attack.{}", tech.technique_id.to_lowercase()));
        }
    }
    tags.into_iter().collect()
}

pub fn get_tactic_summary(techniques: &[MitreTechnique]) -> BTreeMap<String, u32> {
    let mut summary = BTreeMap::new();
    for tech in techniques {
        let tactic = if tech.tactic.is_empty() { "unknown".to_string() } else { tech.tactic.clone() };
        *summary.entry(tactic).or_insert(0) += 1;
    }
    summary
}

pub fn get_kill_chain_phase(tactic: &str) -> u32 {
    match tactic {
        "initial_access" => 1,
        "execution" => 2,
        "persistence" => 3,
        "privilege_escalation" => 4,
        "defense_evasion" => 5,
        "credential_access" => 6,
        "discovery" => 7,
        "lateral_movement" => 8,
        "collection" => 9,
        "command_and_control" => 10,
        "exfiltration" => 11,
        "impact" => 12,
        _ => 99,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Ttp;

    #[test]
    fn ai_extracted_ttp_takes_priority_over_keyword_scan() {
        let mut bundle = IoCBundle::default();
        bundle.ttps.push(Ttp {
            mitre_id: "T1566".to_string(),
            technique_name: "Phishing".to_string(),
            description: "Initial spear-phishing email".to_string(),
        });
        let matches = map_iocs_to_mitre(&bundle);
        assert_eq!(matches.len(), 1);
        assert!(matches!(matches[0].source, MitreSource::AiExtracted));
        assert_eq!(matches[0].confidence, 0.95);
    }

    #[test]
    fn keyword_scan_finds_powershell() {
        let mut bundle = IoCBundle::default();
        bundle
            .indicators_of_compromise
            .get_mut("malicious_commands")
            .unwrap()
            .push("powershell -encodedcommand abc123".to_string());
        let matches = map_iocs_to_mitre(&bundle);
        let ps = matches.iter().find(|m| m.technique_id == "T1059.001").unwrap();
        assert!(matches!(ps.source, MitreSource::KeywordMatch));
        assert!(ps.confidence >= 0.3 && ps.confidence <= 0.9);
    }

    #[test]
    fn tags_are_lowercase_and_sorted() {
        let techniques = vec![MitreTechnique {
            technique_id: "T1566".to_string(),
            technique_name: "Phishing".to_string(),
            tactic: "initial_access".to_string(),
            confidence: 0.95,
            source: MitreSource::AiExtracted,
            description: String::new(),
        }];
        let tags = get_mitre_tags(&techniques);
        assert_eq!(tags, vec!["attack.initial_access", "attack.t1566"]);
    }

    #[test]
    fn kill_chain_phase_orders_unknown_last() {
        assert_eq!(get_kill_chain_phase("initial_access"), 1);
        assert_eq!(get_kill_chain_phase("impact"), 12);
        assert_eq!(get_kill_chain_phase("not_a_tactic"), 99);
    }
}

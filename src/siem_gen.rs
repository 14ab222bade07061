//! Deterministic SIEM query generation (C11): Splunk SPL, QRadar AQL,
//! Elastic DSL, and Sentinel KQL from an [`IoCBundle`]'s indicators.

use crate::models::{SiemQueries, SiemQueryBlock};
use serde_json::json;
use std::collections::BTreeMap;

fn field_map(platform: &str, field: &str) -> &'static str {
    match (platform, field) {
        ("splunk", "process_name") => "Image",
        ("splunk", "command_line") => "CommandLine",
        ("splunk", "parent_process") => "ParentImage",
        ("splunk", "dest_ip") => "dest_ip",
        ("splunk", "domain") => "query",
        ("splunk", "url") => "url",
        ("splunk", "filename") => "file_name",
        ("splunk", "registry_key") => "registry_key_name",
        ("splunk", "hash") => "file_hash",

        ("qradar", "process_name") => "Process Name",
        ("qradar", "command_line") => "Process CommandLine",
        ("qradar", "parent_process") => "Parent Process Name",
        ("qradar", "dest_ip") => "destinationip",
        ("qradar", "domain") => "DNS Query",
        ("qradar", "url") => "URL",
        ("qradar", "filename") => "Filename",
        ("qradar", "registry_key") => "Registry Key",
        ("qradar", "hash") => "File Hash",

        ("elastic", "process_name") => "process.name",
        ("elastic", "command_line") => "process.command_line",
        ("elastic", "parent_process") => "process.parent.name",
        ("elastic", "dest_ip") => "destination.ip",
        ("elastic", "domain") => "dns.question.name",
        ("elastic", "url") => "url.full",
        ("elastic", "filename") => "file.name",
        ("elastic", "registry_key") => "registry.path",
        ("elastic", "hash") => "file.hash.sha256",

        ("sentinel", "process_name") => "ProcessName",
        ("sentinel", "command_line") => "CommandLine",
        ("sentinel", "parent_process") => "ParentProcessName",
        ("sentinel", "dest_ip") => "DestinationIP",
        ("sentinel", "domain") => "DnsQuery",
        ("sentinel", "url") => "RequestURL",
        ("sentinel", "filename") => "FileName",
        ("sentinel", "registry_key") => "RegistryKey",
        ("sentinel", "hash") => "FileHash",

        _ => field,
    }
}

/// Generic IoC-type to platform-agnostic field key; `None` means the IoC
/// type (currently only `email_addresses`) has no standard SIEM field.
fn ioc_to_field(ioc_type: &str) -> Option<&'static str> {
    match ioc_type {
        "ips" => Some("dest_ip"),
        "domains" => Some("domain"),
        "urls" => Some("url"),
        "filenames" => Some("filename"),
        "file_hashes" => Some("hash"),
        "registry_keys" => Some("registry_key"),
        "process_names" => Some("process_name"),
        "malicious_commands" => Some("command_line"),
        _ => None,
    }
}

fn wildcard_field(ioc_type: &str) -> bool {
    matches!(ioc_type, "malicious_commands" | "process_names" | "filenames")
}

struct QueryRow {
    ioc_type: String,
    description: String,
    query: String,
}

fn splunk_source(ioc_type: &str) -> &'static str {
    match ioc_type {
        "malicious_commands" | "process_names" => "index=wineventlog sourcetype=WinEventLog:Sysmon EventCode=1",
        "ips" => "index=wineventlog sourcetype=WinEventLog:Sysmon EventCode=3",
        "domains" => "index=wineventlog sourcetype=WinEventLog:Sysmon EventCode=22",
        "filenames" | "file_hashes" => "index=wineventlog sourcetype=WinEventLog:Sysmon EventCode=11",
        "registry_keys" => "index=wineventlog sourcetype=WinEventLog:Sysmon EventCode=13",
        _ => "index=* sourcetype=*",
    }
}

fn generate_splunk_query(ioc_type: &str, indicators: &[String], field: &str) -> String {
    let platform_field = field_map("splunk", field);
    let source = splunk_source(ioc_type);

    let or_terms: Vec<String> = indicators
        .iter()
        .take(30)
        .map(|ioc| {
            let safe = ioc.replace('"', "\\\"");
            if wildcard_field(ioc_type) {
                format!("{platform_field}=\"*{safe}*\"")
            } else {
                format!("{platform_field}=\"{safe}\"")
            }
        })
        .collect();

    format!(
        "{source}\n| where ({})\n| stats count by {platform_field}, ComputerName, User\n| sort - count",
        or_terms.join(" OR ")
    )
}

fn qradar_base(ioc_type: &str) -> &'static str {
    match ioc_type {
        "malicious_commands" | "process_names" => {
            "SELECT * FROM events WHERE LOGSOURCETYPENAME(logsourceid)='Microsoft Windows Security Event Log' AND EventID IN (4688, 1)"
        }
        "ips" => "SELECT * FROM flows WHERE",
        "domains" => "SELECT * FROM events WHERE EventID=22",
        "filenames" | "file_hashes" => "SELECT * FROM events WHERE EventID IN (11, 23, 26)",
        "registry_keys" => "SELECT * FROM events WHERE EventID IN (12, 13, 14)",
        _ => "SELECT * FROM events WHERE",
    }
}

fn generate_qradar_query(ioc_type: &str, indicators: &[String], field: &str) -> String {
    let platform_field = field_map("qradar", field);
    let base = qradar_base(ioc_type);

    let conditions: Vec<String> = indicators
        .iter()
        .take(30)
        .map(|ioc| {
            let safe = ioc.replace('\'', "''");
            if wildcard_field(ioc_type) {
                format!("UTF8(payload) LIKE '%{safe}%'")
            } else {
                format!("\"{platform_field}\" = '{safe}'")
            }
        })
        .collect();
    let where_clause = conditions.join(" OR ");

    let query = if base.contains("WHERE") {
        format!("{base} AND ({where_clause})")
    } else {
        format!("{base} ({where_clause})")
    };
    format!("{query} ORDER BY starttime DESC LAST 24 HOURS")
}

fn generate_elastic_query(ioc_type: &str, indicators: &[String], field: &str) -> String {
    let platform_field = field_map("elastic", field);
    let should_clauses: Vec<serde_json::Value> = indicators
        .iter()
        .take(30)
        .map(|ioc| {
            if wildcard_field(ioc_type) {
                json!({"wildcard": {platform_field: format!("*{ioc}*")}})
            } else {
                json!({"term": {platform_field: ioc}})
            }
        })
        .collect();

    let query = json!({
        "query": {
            "bool": {
                "should": should_clauses,
                "minimum_should_match": 1,
            }
        },
        "sort": [{"@timestamp": {"order": "desc"}}],
        "size": 100,
    });

    serde_json::to_string_pretty(&query).unwrap_or_default()
}

fn sentinel_source(ioc_type: &str) -> &'static str {
    match ioc_type {
        "malicious_commands" | "process_names" => "SecurityEvent\n| where EventID == 4688",
        "ips" => "CommonSecurityLog\n| where DeviceEventClassID == 3",
        "domains" => "DnsEvents",
        "filenames" | "file_hashes" => "DeviceFileEvents",
        "registry_keys" => "DeviceRegistryEvents",
        _ => "SecurityEvent",
    }
}

fn generate_sentinel_query(ioc_type: &str, indicators: &[String], field: &str) -> String {
    let platform_field = field_map("sentinel", field);
    let source = sentinel_source(ioc_type);
    let taken: Vec<&String> = indicators.iter().take(30).collect();

    let where_clause = if wildcard_field(ioc_type) {
        taken
            .iter()
            .map(|ioc| format!("{platform_field} contains \"{ioc}\""))
            .collect::<Vec<_>>()
            .join(" or ")
    } else {
        let escaped: Vec<String> = taken.iter().map(|ioc| format!("\"{ioc}\"")).collect();
        format!("{platform_field} in ({})", escaped.join(", "))
    };

    format!(
        "{source}\n| where {where_clause}\n| project TimeGenerated, {platform_field}, Computer, Account\n| sort by TimeGenerated desc"
    )
}

/// Runs all four platform generators over every IoC category that has a
/// standard SIEM field, then flattens each platform's per-category queries
/// into a single combined query block (§6).
pub fn generate_siem_queries(ioc_map: &BTreeMap<String, Vec<String>>) -> SiemQueries {
    let mut splunk_rows = Vec::new();
    let mut qradar_rows = Vec::new();
    let mut elastic_rows = Vec::new();
    let mut sentinel_rows = Vec::new();

    for (ioc_type, indicators) in ioc_map {
        if indicators.is_empty() {
            continue;
        }
        let Some(field) = ioc_to_field(ioc_type) else {
            continue;
        };
        let description = format!(
            "Detection query for {} ({} indicators)",
            ioc_type.replace('_', " "),
            indicators.len()
        );

        splunk_rows.push(QueryRow {
            ioc_type: ioc_type.clone(),
            description: description.clone(),
            query: generate_splunk_query(ioc_type, indicators, field),
        });
        qradar_rows.push(QueryRow {
            ioc_type: ioc_type.clone(),
            description: description.clone(),
            query: generate_qradar_query(ioc_type, indicators, field),
        });
        elastic_rows.push(QueryRow {
            ioc_type: ioc_type.clone(),
            description: description.clone(),
            query: generate_elastic_query(ioc_type, indicators, field),
        });
        sentinel_rows.push(QueryRow {
            ioc_type: ioc_type.clone(),
            description,
            query: generate_sentinel_query(ioc_type, indicators, field),
        });
    }

    SiemQueries {
        splunk: flatten(splunk_rows),
        qradar: flatten(qradar_rows),
        elastic: flatten(elastic_rows),
        sentinel: flatten(sentinel_rows),
    }
}

fn flatten(rows: Vec<QueryRow>) -> SiemQueryBlock {
    if rows.is_empty() {
        return SiemQueryBlock {
            description: "No IoC indicators available".to_string(),
            query: "N/A".to_string(),
            notes: "No relevant indicators found for this platform".to_string(),
        };
    }
    let count = rows.len();
    let descriptions = rows.iter().map(|r| r.description.as_str()).collect::<Vec<_>>().join(", ");
    let combined_query = rows
        .iter()
        .map(|r| r.query.as_str())
        .collect::<Vec<_>>()
        .join("\n\n/* --- */\n\n");
    let _ioc_types: Vec<&str> = rows.iter().map(|r| r.ioc_type.as_str()).collect();
    SiemQueryBlock {
        description: descriptions,
        query: combined_query,
        notes: format!("{count} detection queries generated by PERSEPTOR"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_all_four_platforms_for_populated_categories() {
        let mut map = BTreeMap::new();
        map.insert("ips".to_string(), vec!["203.0.113.5".to_string()]);
        let queries = generate_siem_queries(&map);
        assert!(queries.splunk.query.contains("dest_ip"));
        assert!(queries.qradar.query.contains("destinationip"));
        assert!(queries.elastic.query.contains("destination.ip"));
        assert!(queries.sentinel.query.contains("DestinationIP"));
    }

    #[test]
    fn skips_email_addresses_with_no_standard_field() {
        let mut map = BTreeMap::new();
        map.insert("email_addresses".to_string(), vec!["a@b.com".to_string()]);
        let queries = generate_siem_queries(&map);
        assert_eq!(queries.splunk.query, "N/A");
    }

    #[test]
    fn wildcard_types_use_contains_semantics_in_sentinel() {
        let mut map = BTreeMap::new();
        map.insert("malicious_commands".to_string(), vec!["whoami /all".to_string()]);
        let queries = generate_siem_queries(&map);
        assert!(queries.sentinel.query.contains("contains"));
    }
}

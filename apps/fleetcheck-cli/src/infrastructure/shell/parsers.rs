//! Parsers for tool output: nodetool subcommands and common OS commands.
//! Each parser returns ordered row maps so downstream threshold logic
//! works on numbers, not strings.

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::engine::operation::Row;
use crate::utilities::units::parse_size_to_bytes;

fn row_from(pairs: Vec<(&str, Value)>) -> Row {
    let mut row = Row::new();
    for (k, v) in pairs {
        row.insert(k.to_string(), v);
    }
    row
}

/// Dispatcher for nodetool output. Unknown subcommands fall back to a
/// single raw-output row.
pub fn parse_nodetool(command: &str, output: &str) -> Vec<Row> {
    let subcommand = command.split_whitespace().next().unwrap_or(command);
    match subcommand {
        "status" => parse_nodetool_status(output),
        "tpstats" => parse_nodetool_tpstats(output),
        "info" => vec![parse_nodetool_info(output)],
        "gcstats" => vec![parse_nodetool_gcstats(output)],
        _ => {
            warn!("no parser for nodetool subcommand: {}", subcommand);
            vec![row_from(vec![
                ("command", json!(command)),
                ("output", json!(output)),
            ])]
        }
    }
}

/// `nodetool status`: one row per node line (UN/DN/UJ/UL/...).
pub fn parse_nodetool_status(output: &str) -> Vec<Row> {
    let mut nodes = Vec::new();
    let mut current_dc = "unknown".to_string();

    for line in output.lines() {
        if let Some(rest) = line.split("Datacenter:").nth(1) {
            current_dc = rest.trim().to_string();
            continue;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 8 {
            continue;
        }
        let flag = parts[0];
        if !matches!(flag, "UN" | "UL" | "UJ" | "UM" | "DN" | "DL" | "DJ" | "DM") {
            continue;
        }

        let owns = parts[5].trim_end_matches('%').parse::<f64>().unwrap_or(0.0);
        nodes.push(row_from(vec![
            ("datacenter", json!(current_dc)),
            ("status", json!(&flag[..1])),
            ("state", json!(&flag[1..])),
            ("address", json!(parts[1])),
            ("load", json!(format!("{} {}", parts[2], parts[3]))),
            (
                "load_bytes",
                json!(parse_size_to_bytes(&format!("{} {}", parts[2], parts[3]))),
            ),
            ("tokens", json!(parts[4].parse::<u64>().unwrap_or(0))),
            ("owns_effective_percent", json!(owns)),
            ("host_id", json!(parts[6])),
            ("rack", json!(parts[7])),
        ]));
    }
    nodes
}

/// `nodetool tpstats`: one row per thread pool.
pub fn parse_nodetool_tpstats(output: &str) -> Vec<Row> {
    let lines: Vec<&str> = output.lines().collect();
    let Some(header_index) = lines
        .iter()
        .position(|l| l.to_lowercase().contains("pool name"))
    else {
        warn!("could not find header in nodetool tpstats output");
        return Vec::new();
    };

    let mut pools = Vec::new();
    for line in &lines[header_index + 1..] {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 6 {
            continue;
        }
        let numbers: Option<Vec<i64>> = parts[1..6].iter().map(|p| p.parse().ok()).collect();
        let Some(numbers) = numbers else {
            // Summary or malformed line
            debug!("skipping line in tpstats: {}", line);
            continue;
        };
        pools.push(row_from(vec![
            ("pool_name", json!(parts[0])),
            ("active", json!(numbers[0])),
            ("pending", json!(numbers[1])),
            ("completed", json!(numbers[2])),
            ("blocked", json!(numbers[3])),
            ("all_time_blocked", json!(numbers[4])),
        ]));
    }
    pools
}

/// `nodetool info`: a single attribute row.
pub fn parse_nodetool_info(output: &str) -> Row {
    let mut row = Row::new();
    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        match key {
            "ID" => {
                row.insert("id".into(), json!(value));
            }
            "Load" => {
                row.insert("load".into(), json!(value));
                row.insert("load_bytes".into(), json!(parse_size_to_bytes(value)));
            }
            "Uptime (seconds)" => {
                row.insert("uptime_seconds".into(), json!(value.parse::<u64>().unwrap_or(0)));
            }
            "Heap Memory (MB)" => {
                if let Some((used, total)) = value.split_once('/') {
                    let used = used.trim().parse::<f64>().unwrap_or(0.0);
                    let total = total.trim().parse::<f64>().unwrap_or(0.0);
                    row.insert("heap_memory_mb_used".into(), json!(used));
                    row.insert("heap_memory_mb_total".into(), json!(total));
                    let pct = if total > 0.0 { used / total * 100.0 } else { 0.0 };
                    row.insert("heap_memory_percent".into(), json!(pct));
                }
            }
            "Data Center" => {
                row.insert("datacenter".into(), json!(value));
            }
            "Rack" => {
                row.insert("rack".into(), json!(value));
            }
            "Exceptions" => {
                row.insert("exceptions".into(), json!(value.parse::<u64>().unwrap_or(0)));
            }
            "Percent Repaired" => {
                let pct = value.trim_end_matches('%').parse::<f64>().unwrap_or(0.0);
                row.insert("percent_repaired".into(), json!(pct));
            }
            _ => {}
        }
    }
    row
}

/// `nodetool gcstats`: a single attribute row. NaN columns become null.
pub fn parse_nodetool_gcstats(output: &str) -> Row {
    let mut row = Row::new();
    let Some(data_line) = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.contains("Interval") && !l.contains("GC Elapsed"))
    else {
        warn!("could not find data line in gcstats output");
        return row;
    };

    let parts: Vec<&str> = data_line.split_whitespace().collect();
    if parts.len() < 7 {
        warn!("unexpected gcstats format (expected 7 columns, got {})", parts.len());
        return row;
    }

    let field = |raw: &str| -> Value {
        if raw.eq_ignore_ascii_case("nan") {
            Value::Null
        } else {
            raw.parse::<i64>().map_or(Value::Null, |v| json!(v))
        }
    };

    row.insert("interval_ms".into(), field(parts[0]));
    row.insert("max_gc_elapsed_ms".into(), field(parts[1]));
    row.insert("total_gc_elapsed_ms".into(), field(parts[2]));
    row.insert("stdev_gc_elapsed_ms".into(), field(parts[3]));
    row.insert("gc_reclaimed_mb".into(), field(parts[4]));
    row.insert("collections".into(), field(parts[5]));
    row.insert("direct_memory_bytes".into(), field(parts[6]));
    row
}

/// Dispatcher for plain shell tools that have dedicated parsers.
pub fn parse_shell_output(command: &str, output: &str) -> Option<Vec<Row>> {
    let name = command.split_whitespace().next()?;
    let name = name.rsplit('/').next().unwrap_or(name);
    match name {
        "df" => Some(parse_df(output)),
        "free" => Some(vec![parse_free(output)]),
        "cat" if command.contains("/proc/meminfo") => Some(vec![parse_meminfo(output)]),
        _ => None,
    }
}

/// `df -h`: one row per filesystem.
pub fn parse_df(output: &str) -> Vec<Row> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 6 {
                return None;
            }
            let use_pct = parts[4].trim_end_matches('%').parse::<f64>().unwrap_or(0.0);
            Some(row_from(vec![
                ("filesystem", json!(parts[0])),
                ("size", json!(parts[1])),
                ("used", json!(parts[2])),
                ("avail", json!(parts[3])),
                ("use_pct", json!(use_pct)),
                ("mounted_on", json!(parts[5])),
            ]))
        })
        .collect()
}

/// `free -m`: a single attribute row, values in MiB.
pub fn parse_free(output: &str) -> Row {
    let mut row = Row::new();
    for line in output.lines() {
        if let Some(rest) = line.strip_prefix("Mem:") {
            let parts: Vec<&str> = rest.split_whitespace().collect();
            let field = |i: usize| parts.get(i).and_then(|p| p.parse::<f64>().ok()).unwrap_or(0.0);
            row.insert("total_mb".into(), json!(field(0)));
            row.insert("used_mb".into(), json!(field(1)));
            row.insert("free_mb".into(), json!(field(2)));
            row.insert("shared_mb".into(), json!(field(3)));
            row.insert("buff_cache_mb".into(), json!(field(4)));
            let available = parts.get(5).and_then(|p| p.parse::<f64>().ok()).unwrap_or(field(2));
            row.insert("available_mb".into(), json!(available));
            let total = field(0);
            let used_pct = if total > 0.0 { field(1) / total * 100.0 } else { 0.0 };
            row.insert("used_pct".into(), json!(used_pct));
            break;
        }
    }
    row
}

/// `/proc/meminfo`: a single attribute row, values normalized to bytes.
pub fn parse_meminfo(output: &str) -> Row {
    let mut row = Row::new();
    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if !matches!(key, "MemTotal" | "MemFree" | "MemAvailable" | "Buffers" | "Cached" | "SwapTotal" | "SwapFree") {
            continue;
        }
        let bytes = parse_size_to_bytes(value.trim());
        row.insert(format!("{}_bytes", key.to_lowercase()), json!(bytes));
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS_OUTPUT: &str = "\
Datacenter: dc1
==============
Status=Up/Down
|/ State=Normal/Leaving/Joining/Moving
--  Address      Load       Tokens  Owns (effective)  Host ID                               Rack
UN  10.0.1.10    108.45 KB  256     33.3%             aaa-bbb-ccc                           rack1
UN  10.0.1.11    2.1 GB     256     33.3%             ddd-eee-fff                           rack1
DN  10.0.1.12    1.9 GB     256     33.4%             ggg-hhh-iii                           rack2
";

    #[test]
    fn test_parse_nodetool_status() {
        let nodes = parse_nodetool_status(STATUS_OUTPUT);
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0]["address"], "10.0.1.10");
        assert_eq!(nodes[0]["datacenter"], "dc1");
        assert_eq!(nodes[0]["status"], "U");
        assert_eq!(nodes[2]["status"], "D");
        assert_eq!(nodes[1]["load_bytes"], json!(2254857830u64));
    }

    #[test]
    fn test_parse_nodetool_tpstats_skips_summary_lines() {
        let output = "\
Pool Name                         Active  Pending  Completed  Blocked  All time blocked
ReadStage                              0        0      10492        0                 0
MutationStage                          2        5      88211        0                 3

Message type           Dropped
READ                         0
";
        let pools = parse_nodetool_tpstats(output);
        assert_eq!(pools.len(), 2, "summary section must not parse as pools");
        assert_eq!(pools[1]["pool_name"], "MutationStage");
        assert_eq!(pools[1]["pending"], json!(5));
    }

    #[test]
    fn test_parse_nodetool_info_heap() {
        let output = "\
ID                     : aaa-bbb
Load                   : 108.45 KB
Uptime (seconds)       : 86400
Heap Memory (MB)       : 512.00 / 2048.00
Data Center            : dc1
Rack                   : rack1
Exceptions             : 0
Percent Repaired       : 100.0%
";
        let info = parse_nodetool_info(output);
        assert_eq!(info["uptime_seconds"], json!(86400));
        assert_eq!(info["heap_memory_percent"], json!(25.0));
        assert_eq!(info["load_bytes"], json!(111052u64));
    }

    #[test]
    fn test_parse_gcstats_nan_becomes_null() {
        let output = "\
Interval (ms) Max GC Elapsed (ms)Total GC Elapsed (ms)Stdev GC Elapsed (ms)GC Reclaimed (MB)         Collections      Direct Memory Bytes
      3600000                 120                 840                  NaN              1024                  12                       -1
";
        let stats = parse_nodetool_gcstats(output);
        assert_eq!(stats["max_gc_elapsed_ms"], json!(120));
        assert_eq!(stats["stdev_gc_elapsed_ms"], Value::Null);
        assert_eq!(stats["direct_memory_bytes"], json!(-1));
    }

    #[test]
    fn test_parse_df() {
        let output = "\
Filesystem      Size  Used Avail Use% Mounted on
/dev/nvme0n1p1  200G  150G   50G  75% /
tmpfs            16G     0   16G   0% /dev/shm
";
        let rows = parse_df(output);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["use_pct"], json!(75.0));
        assert_eq!(rows[0]["mounted_on"], "/");
    }

    #[test]
    fn test_parse_free() {
        let output = "\
              total        used        free      shared  buff/cache   available
Mem:          64000       48000        4000        1000       12000       14000
Swap:          8000           0        8000
";
        let mem = parse_free(output);
        assert_eq!(mem["total_mb"], json!(64000.0));
        assert_eq!(mem["used_pct"], json!(75.0));
        assert_eq!(mem["available_mb"], json!(14000.0));
    }

    #[test]
    fn test_parse_meminfo_normalizes_to_bytes() {
        let output = "MemTotal:       65536000 kB\nMemAvailable:   16384000 kB\nDirty: 12 kB\n";
        let mem = parse_meminfo(output);
        assert_eq!(mem["memtotal_bytes"], json!(65536000u64 * 1024));
        assert!(mem.get("dirty_bytes").is_none(), "only the tracked keys are kept");
    }
}

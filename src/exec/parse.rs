//! Parsers for the text the fleet manager and cluster tools print.
//!
//! Grammar of `salt --out=txt` output:
//!
//! ```text
//! output := line*
//! line   := <minion-id> ": " <value> "\n"
//! ```
//!
//! The id is everything before the first `": "`. Blank lines and lines
//! without the separator are ignored. A minion that did not answer prints
//! nothing at all.
//!
//! Grammar of `etcdctl member list` (v3, simple format):
//!
//! ```text
//! line := <id> ", " <status> ", " <name> ", " <peer-urls> ", " <client-urls> [", " <is-learner>]
//! ```

/// Split `--out=txt` output into `(id, value)` pairs.
pub fn entries(output: &str) -> Vec<(&str, &str)> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim_end();
            let (id, value) = line.split_once(": ")?;
            let id = id.trim();
            if id.is_empty() {
                return None;
            }
            Some((id, value.trim()))
        })
        .collect()
}

/// Ids that answered `True` to a `test.ping`, in order and deduplicated.
pub fn responding(output: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for (id, value) in entries(output) {
        if value == "True" && !ids.iter().any(|known| known == id) {
            ids.push(id.to_string());
        }
    }
    ids
}

/// Every id present in the output, deduplicated.
pub fn minions(output: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for (id, _) in entries(output) {
        if !ids.iter().any(|known| known == id) {
            ids.push(id.to_string());
        }
    }
    ids
}

/// The value printed for one id.
pub fn value_of(output: &str, id: &str) -> Option<String> {
    entries(output)
        .into_iter()
        .find(|(candidate, _)| *candidate == id)
        .map(|(_, value)| value.to_string())
}

/// Member id of the etcd member whose name equals `hostname`.
pub fn etcd_member_id(output: &str, hostname: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() >= 3 && !fields[0].is_empty() && fields[2] == hostname {
            Some(fields[0].to_string())
        } else {
            None
        }
    })
}

/// Certificate key printed by `kubeadm init phase upload-certs --upload-certs`.
pub fn certificate_key(output: &str) -> Option<String> {
    let mut lines = output.lines();
    lines.find(|line| line.contains("Using certificate key"))?;
    lines
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// Version printed by `rpm -q --qf '%{VERSION}'`.
pub fn package_version(output: &str) -> String {
    output.trim().trim_matches('\'').trim().to_string()
}

/// Ensure a Kubernetes version carries its leading `v`.
pub fn normalize_version(version: &str) -> String {
    let version = version.trim();
    if version.is_empty() || version.starts_with('v') {
        version.to_string()
    } else {
        format!("v{}", version)
    }
}

/// Join command printed by `kubeadm token create --print-join-command`.
pub fn join_command(output: &str) -> String {
    output.trim_end_matches(['\n', '\r']).trim().to_string()
}

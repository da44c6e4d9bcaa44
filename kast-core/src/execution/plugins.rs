use serde::Serialize;

/// One entry of the tool's `--list-plugins` output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PluginInfo {
    /// Plugin identifier, as used with `--run-only`.
    pub name: String,
    /// One-line summary, if the tool printed one.
    pub description: Option<String>,
    /// `✓` entries are usable on this host, `✗` entries are not.
    pub available: bool,
    /// Lower runs first.
    pub priority: Option<u32>,
    /// `passive` or `active`.
    pub kind: Option<String>,
}

/// Parse listing lines of the form
///
/// ```text
/// ✓ subfinder (priority: 1, type: passive)
///   Subdomain discovery
/// ✗ katana (priority: 5, type: active)
/// ```
///
/// Anything that is not a marker line or the description right after one
/// is ignored.
pub fn parse_plugin_listing(stdout: &str) -> Vec<PluginInfo> {
    let lines: Vec<&str> = stdout.lines().map(str::trim).collect();
    let mut plugins = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        let (available, rest) = if let Some(rest) = line.strip_prefix('✓') {
            (true, rest)
        } else if let Some(rest) = line.strip_prefix('✗') {
            (false, rest)
        } else {
            continue;
        };

        let (head, attrs) = match rest.split_once('(') {
            Some((head, attrs)) => (head, Some(attrs.trim_end_matches(')'))),
            None => (rest, None),
        };
        let Some(name) = head.split_whitespace().last() else {
            continue;
        };

        let mut priority = None;
        let mut kind = None;
        for attr in attrs.into_iter().flat_map(|a| a.split(',')) {
            match attr.split_once(':').map(|(k, v)| (k.trim(), v.trim())) {
                Some(("priority", value)) => priority = value.parse().ok(),
                Some(("type", value)) if !value.is_empty() => kind = Some(value.to_string()),
                _ => {}
            }
        }

        let description = lines
            .get(idx + 1)
            .filter(|next| {
                !next.is_empty()
                    && !next.starts_with('✓')
                    && !next.starts_with('✗')
                    && !next.starts_with("Available")
            })
            .map(|next| next.to_string());

        plugins.push(PluginInfo {
            name: name.to_string(),
            description,
            available,
            priority,
            kind,
        });
    }

    plugins
}

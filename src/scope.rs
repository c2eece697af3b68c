use std::collections::HashSet;

/// Domain scope for dispatch: a query is handled when its name sits inside the
/// configured zone and outside every excluded domain. Out-of-scope queries are
/// handed back to the host pipeline.
#[derive(Debug, Clone)]
pub struct QueryScope {
    zone: String,
    exclude: DomainSet,
}

impl QueryScope {
    pub fn new(zone: &str, exclude: &[String]) -> Self {
        Self {
            zone: normalize(zone),
            exclude: DomainSet::from_names(exclude),
        }
    }

    pub fn matches(&self, qname: &str) -> bool {
        let name = normalize(qname);
        in_zone(&name, &self.zone) && !self.exclude.contains(&name)
    }
}

impl Default for QueryScope {
    fn default() -> Self {
        Self::new(".", &[])
    }
}

/// Set of domains matched by exact name or any parent suffix.
#[derive(Debug, Clone, Default)]
pub struct DomainSet {
    names: HashSet<String>,
}

impl DomainSet {
    pub fn from_names(names: &[String]) -> Self {
        Self {
            names: names.iter().map(|n| normalize(n)).collect(),
        }
    }

    pub fn contains(&self, qname: &str) -> bool {
        if self.names.is_empty() {
            return false;
        }
        let mut search = normalize(qname);
        loop {
            if self.names.contains(search.as_str()) {
                return true;
            }
            match search.find('.') {
                Some(idx) => search = search[idx + 1..].to_string(),
                None => return false,
            }
        }
    }
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

fn in_zone(name: &str, zone: &str) -> bool {
    if zone.is_empty() {
        // root zone matches everything
        return true;
    }
    name == zone || name.ends_with(&format!(".{zone}"))
}

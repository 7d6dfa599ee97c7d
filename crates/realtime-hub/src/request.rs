use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use realtime_transport::{ChangeEvent, ChangeKind};

use crate::error::{HubError, HubResult};

/// Consumer callback. Errors and panics are contained by the hub and logged.
pub type ChangeCallback = Arc<dyn Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync>;

/// A consumer's declaration of interest in changes on one resource.
#[derive(Clone)]
pub struct SubscriptionRequest {
    group: String,
    resource: String,
    kinds: BTreeSet<ChangeKind>,
    filter: Option<String>,
    callback: ChangeCallback,
}

impl SubscriptionRequest {
    pub fn new<F>(
        group: impl Into<String>,
        resource: impl Into<String>,
        kinds: impl IntoIterator<Item = ChangeKind>,
        callback: F,
    ) -> HubResult<Self>
    where
        F: Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let group = group.into();
        let resource = resource.into();
        let kinds: BTreeSet<ChangeKind> = kinds.into_iter().collect();
        if group.trim().is_empty() {
            return Err(HubError::InvalidRequest("group name is empty".into()));
        }
        if resource.trim().is_empty() {
            return Err(HubError::InvalidRequest("resource name is empty".into()));
        }
        if kinds.is_empty() {
            return Err(HubError::InvalidRequest(format!(
                "no change kinds requested for {resource}"
            )));
        }
        Ok(Self {
            group,
            resource,
            kinds,
            filter: None,
            callback: Arc::new(callback),
        })
    }

    /// Narrow the request with a row filter. Blank filters are ignored.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        let filter = filter.into();
        let filter = filter.trim();
        self.filter = (!filter.is_empty()).then(|| filter.to_string());
        self
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn kinds(&self) -> &BTreeSet<ChangeKind> {
        &self.kinds
    }

    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey {
            group: self.group.clone(),
            resource: self.resource.clone(),
            kinds: self.kinds.clone(),
            filter: self.filter.clone(),
        }
    }

    pub(crate) fn callback(&self) -> ChangeCallback {
        Arc::clone(&self.callback)
    }
}

impl fmt::Debug for SubscriptionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRequest")
            .field("group", &self.group)
            .field("resource", &self.resource)
            .field("kinds", &self.kinds)
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

/// Parse a comma separated kind list such as `INSERT,UPDATE`; `*` or `ALL` selects every kind.
pub fn parse_kinds(list: &str) -> HubResult<BTreeSet<ChangeKind>> {
    let list = list.trim();
    if list == "*" || list.eq_ignore_ascii_case("all") {
        return Ok(ChangeKind::ALL.into_iter().collect());
    }
    list.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| part.parse::<ChangeKind>().map_err(HubError::from))
        .collect()
}

/// Identity of one shareable connection.
///
/// Equality is structural, so requests that differ in any component never share
/// a connection. The `Display` form escapes separators and is injective as well.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    group: String,
    resource: String,
    kinds: BTreeSet<ChangeKind>,
    filter: Option<String>,
}

impl SubscriptionKey {
    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: Vec<&str> = self.kinds.iter().map(ChangeKind::as_str).collect();
        write!(
            f,
            "{}:{}:{}:{}",
            escape(&self.group),
            escape(&self.resource),
            kinds.join(","),
            self.filter.as_deref().map(escape).unwrap_or_default()
        )
    }
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch == ':' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

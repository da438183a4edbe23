use std::time::Duration;

use harbor_proto::LoadSample;
use tokio::time::Instant;

use crate::error::ControlError;
use crate::ids::IdAllocator;

/// A registered placement target: a worker node or a local directory.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub id: u32,
    pub url: String,
    pub region: String,
    pub supported_types: Vec<String>,
    pub load: LoadSample,
    pub healthy: bool,
    pub last_health_check: Instant,
}

impl Endpoint {
    pub fn supports(&self, service_type: &str) -> bool {
        self.supported_types.iter().any(|t| t == service_type)
    }

    fn is_fresh(&self, stale_after: Option<Duration>) -> bool {
        self.healthy
            && stale_after.map_or(true, |limit| self.last_health_check.elapsed() <= limit)
    }
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub url: String,
    pub region: String,
    pub supported_types: Vec<String>,
    pub load: LoadSample,
}

/// Endpoints in registration order.
///
/// With `stale_after` set, an endpoint whose last successful health check is older
/// than the limit is treated as stale even if no probe has failed yet.
#[derive(Debug, Default)]
pub struct EndpointPool {
    entries: Vec<Endpoint>,
    ids: IdAllocator,
    stale_after: Option<Duration>,
}

impl EndpointPool {
    pub fn new(stale_after: Option<Duration>) -> Self {
        Self {
            entries: Vec::new(),
            ids: IdAllocator::new(),
            stale_after,
        }
    }

    /// Register `reg.url`. A live endpoint with the same url is rejected; a stale one
    /// is replaced in place and keeps its id and position.
    pub fn register(&mut self, reg: Registration) -> Result<u32, ControlError> {
        if !reg.load.is_valid() {
            return Err(ControlError::InvalidRequest(format!(
                "load sample out of range for {}",
                reg.url
            )));
        }
        let stale_after = self.stale_after;
        let now = Instant::now();
        if let Some(existing) = self.entries.iter_mut().find(|e| e.url == reg.url) {
            if existing.is_fresh(stale_after) {
                return Err(ControlError::InvalidRequest(format!(
                    "{} is already registered",
                    reg.url
                )));
            }
            existing.region = reg.region;
            existing.supported_types = reg.supported_types;
            existing.load = reg.load;
            existing.healthy = true;
            existing.last_health_check = now;
            return Ok(existing.id);
        }
        let id = self.ids.grab_next_id();
        self.entries.push(Endpoint {
            id,
            url: reg.url,
            region: reg.region,
            supported_types: reg.supported_types,
            load: reg.load,
            healthy: true,
            last_health_check: now,
        });
        Ok(id)
    }

    /// Replace the load sample. A load report also counts as a sign of life.
    pub fn update_load(&mut self, id: u32, load: LoadSample) -> Result<(), ControlError> {
        if !load.is_valid() {
            return Err(ControlError::InvalidRequest(format!(
                "load sample out of range for endpoint {id}"
            )));
        }
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| ControlError::InvalidRequest(format!("unknown endpoint {id}")))?;
        entry.load = load;
        entry.healthy = true;
        entry.last_health_check = Instant::now();
        Ok(())
    }

    pub fn set_supported_types(&mut self, id: u32, types: Vec<String>) -> Result<(), ControlError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| ControlError::InvalidRequest(format!("unknown endpoint {id}")))?;
        entry.supported_types = types;
        Ok(())
    }

    pub fn mark_healthy(&mut self, url: &str) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.url == url) {
            entry.healthy = true;
            entry.last_health_check = Instant::now();
        }
    }

    pub fn mark_stale(&mut self, url: &str) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.url == url) {
            entry.healthy = false;
        }
    }

    pub fn get(&self, url: &str) -> Option<&Endpoint> {
        self.entries.iter().find(|e| e.url == url)
    }

    pub fn is_eligible(&self, url: &str) -> bool {
        self.get(url).is_some_and(|e| e.is_fresh(self.stale_after))
    }

    pub fn urls(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.url.clone()).collect()
    }

    pub fn entries(&self) -> &[Endpoint] {
        &self.entries
    }

    /// Lowest-load fresh endpoint supporting `service_type`; ties go to the earliest
    /// registration.
    pub fn least_loaded(&self, service_type: &str) -> Option<&Endpoint> {
        self.entries
            .iter()
            .filter(|e| e.is_fresh(self.stale_after) && e.supports(service_type))
            .min_by(|a, b| a.load.load().total_cmp(&b.load.load()))
    }

    /// Fresh endpoints supporting `service_type`, best first. Endpoints in `region`
    /// come first when there are any.
    pub fn ranked(&self, service_type: &str, region: Option<&str>) -> Vec<Endpoint> {
        let mut candidates: Vec<Endpoint> = self
            .entries
            .iter()
            .filter(|e| e.is_fresh(self.stale_after) && e.supports(service_type))
            .cloned()
            .collect();
        let region = region.filter(|r| candidates.iter().any(|e| e.region == *r));
        candidates.sort_by(|a, b| {
            let away = |e: &Endpoint| region.is_some_and(|r| e.region != r);
            away(a)
                .cmp(&away(b))
                .then(a.load.load().total_cmp(&b.load.load()))
        });
        candidates
    }

    /// Union of supported types over fresh endpoints, sorted.
    pub fn supported_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.is_fresh(self.stale_after))
            .flat_map(|e| e.supported_types.iter().cloned())
            .collect();
        types.sort();
        types.dedup();
        types
    }

    /// Mean load over fresh endpoints.
    pub fn aggregate_load(&self) -> LoadSample {
        LoadSample::mean(
            self.entries
                .iter()
                .filter(|e| e.is_fresh(self.stale_after))
                .map(|e| &e.load),
        )
        .unwrap_or_default()
    }
}

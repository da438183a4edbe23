use std::collections::{BTreeSet, HashMap};

use harbor_proto::ServiceSpec;
use parking_lot::RwLock;

/// Session type → ordered list of services every session of that type needs.
#[derive(Debug, Default)]
pub struct MandatoryServiceSet {
    by_type: RwLock<HashMap<String, Vec<ServiceSpec>>>,
}

const DEFAULT_CATALOG: &[(&str, &[&str])] = &[
    (
        "development",
        &[
            "Model",
            "PHREEC",
            "Modeling",
            "Visualization",
            "FITTD",
            "CartesianMesh",
            "TetMesh",
            "ImportParameterizedData",
            "GetDP",
            "ElmerFEM",
            "Debug",
            "PythonExecution",
            "DataProcessing",
            "CircuitSimulator",
        ],
    ),
    (
        "3d-sim",
        &[
            "Model",
            "PHREEC",
            "Modeling",
            "Visualization",
            "FITTD",
            "CartesianMesh",
            "TetMesh",
            "GetDP",
            "ElmerFEM",
        ],
    ),
    (
        "data-pipeline",
        &[
            "Model",
            "ImportParameterizedData",
            "PythonExecution",
            "DataProcessing",
        ],
    ),
    ("studio-suite", &["Model", "StudioSuite"]),
    ("lt-spice", &["Model", "LTSpice"]),
    (
        "pyrit",
        &["Model", "Modeling", "Visualization", "TetMesh", "Pyrit"],
    ),
    ("circuit-simulation", &["Model", "CircuitSimulator"]),
];

impl MandatoryServiceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in catalog. Each service's name doubles as its type.
    pub fn with_defaults() -> Self {
        let set = Self::new();
        for (session_type, services) in DEFAULT_CATALOG {
            for name in services.iter() {
                set.add(session_type, ServiceSpec::new(*name, *name));
            }
        }
        set
    }

    /// Services for `session_type`; unknown types have none.
    pub fn get(&self, session_type: &str) -> Vec<ServiceSpec> {
        self.by_type
            .read()
            .get(session_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Append `spec` unless it is already listed. Returns whether it was added.
    pub fn add(&self, session_type: &str, spec: ServiceSpec) -> bool {
        let mut guard = self.by_type.write();
        let entries = guard.entry(session_type.to_string()).or_default();
        if entries.contains(&spec) {
            return false;
        }
        entries.push(spec);
        true
    }

    pub fn contains_name(&self, service_name: &str) -> bool {
        self.by_type
            .read()
            .values()
            .any(|entries| entries.iter().any(|s| s.name == service_name))
    }
}

/// Names of services that run under a developer's debugger instead of being placed.
#[derive(Debug, Default)]
pub struct DebugServiceList {
    names: RwLock<BTreeSet<String>>,
}

impl DebugServiceList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable debug hosting for `name`. Only names from some mandatory set qualify.
    pub fn enable(&self, name: &str, mandatory: &MandatoryServiceSet) -> bool {
        if !mandatory.contains_name(name) {
            return false;
        }
        self.names.write().insert(name.to_string());
        true
    }

    pub fn disable(&self, name: &str) -> bool {
        self.names.write().remove(name)
    }

    pub fn is_debug(&self, name: &str) -> bool {
        self.names.read().contains(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.names.read().iter().cloned().collect()
    }
}

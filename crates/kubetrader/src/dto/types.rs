//! Supply-chain DTO model transmitted to the market.

use serde::Serialize;

use crate::metrics::EntityKind;
use crate::metrics::Point;
use crate::metrics::ResourceKind;

/// Commodity types traded in the market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CommodityType {
    VCpu,
    VMem,
    VCpuRequest,
    VMemRequest,
    VCpuThrottling,
    VStorage,
    NumPods,
    /// Bootstrap commodity binding entities to their cluster; exempt
    /// from provider matching.
    Cluster,
}

impl CommodityType {
    pub fn from_resource(resource: ResourceKind) -> Option<Self> {
        match resource {
            ResourceKind::Cpu | ResourceKind::CpuMillicore => Some(CommodityType::VCpu),
            ResourceKind::Memory => Some(CommodityType::VMem),
            ResourceKind::CpuRequest => Some(CommodityType::VCpuRequest),
            ResourceKind::MemoryRequest => Some(CommodityType::VMemRequest),
            ResourceKind::VcpuThrottling => Some(CommodityType::VCpuThrottling),
            ResourceKind::VStorage => Some(CommodityType::VStorage),
            ResourceKind::NumPods => Some(CommodityType::NumPods),
            ResourceKind::CpuFrequency => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CommodityDto {
    pub commodity_type: CommodityType,
    /// Disambiguates providers selling the same commodity type.
    pub key: Option<String>,
    pub used: f64,
    pub peak: Option<f64>,
    pub capacity: Option<f64>,
    pub resizable: bool,
    pub active: bool,
    /// `(timestamp, utilization%)` history points.
    pub utilization_points: Vec<Point>,
}

impl CommodityDto {
    pub fn new(commodity_type: CommodityType, used: f64) -> Self {
        Self {
            commodity_type,
            key: None,
            used,
            peak: None,
            capacity: None,
            resizable: false,
            active: true,
            utilization_points: Vec::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_capacity(mut self, capacity: f64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_peak(mut self, peak: f64) -> Self {
        self.peak = Some(peak);
        self
    }
}

/// All commodities bought from one provider.
#[derive(Debug, Clone, Serialize)]
pub struct BoughtFromProvider {
    pub provider_id: String,
    pub provider_kind: EntityKind,
    pub commodities: Vec<CommodityDto>,
}

/// Stitching property namespace understood by the market.
pub const PROPERTY_NAMESPACE_DEFAULT: &str = "DEFAULT";

pub const PROPERTY_VM_IP: &str = "Proxy_VM_IP";
pub const PROPERTY_VM_UUID: &str = "Proxy_VM_UUID";
pub const PROPERTY_PROVIDER_ID: &str = "ProviderId";
pub const PROPERTY_NODE_NAME: &str = "KubernetesNodeName";
pub const PROPERTY_CONTROLLER_KIND: &str = "ControllerKind";
pub const PROPERTY_STALE_METRICS: &str = "StaleMetrics";

#[derive(Debug, Clone, Serialize)]
pub struct EntityProperty {
    pub namespace: String,
    pub name: String,
    pub value: String,
}

impl EntityProperty {
    pub fn new(name: &str, value: impl Into<String>) -> Self {
        Self {
            namespace: PROPERTY_NAMESPACE_DEFAULT.to_string(),
            name: name.to_string(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityDto {
    pub entity_kind: EntityKind,
    /// Stable id: node UID, pod UID, `podUID/containerName`,
    /// `controllerUID/containerName`, ...
    pub id: String,
    pub display_name: String,
    pub sold: Vec<CommodityDto>,
    pub bought: Vec<BoughtFromProvider>,
    pub properties: Vec<EntityProperty>,
}

impl EntityDto {
    pub fn new(entity_kind: EntityKind, id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            entity_kind,
            id: id.into(),
            display_name: display_name.into(),
            sold: Vec::new(),
            bought: Vec::new(),
            properties: Vec::new(),
        }
    }

    pub fn sold_of_type(&self, t: CommodityType) -> Option<&CommodityDto> {
        self.sold.iter().find(|c| c.commodity_type == t)
    }
}

/// The full entity set emitted for one discovery cycle. The market
/// treats it as a set; emission order is unspecified.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub cluster_id: String,
    pub cluster_name: String,
    pub timestamp: i64,
    pub entities: Vec<EntityDto>,
}

//! Per-entity DTO builders and snapshot validation.

use core::error::Error;
use std::collections::HashMap;
use std::collections::HashSet;

use derive_more::Display;
use tracing::debug;
use tracing::warn;

use super::builder::FrequencyConverter;
use super::builder::GeneralBuilder;
use super::types::BoughtFromProvider;
use super::types::CommodityDto;
use super::types::CommodityType;
use super::types::EntityDto;
use super::types::EntityProperty;
use super::types::Snapshot;
use super::types::PROPERTY_CONTROLLER_KIND;
use super::types::PROPERTY_NODE_NAME;
use super::types::PROPERTY_PROVIDER_ID;
use super::types::PROPERTY_STALE_METRICS;
use super::types::PROPERTY_VM_IP;
use super::types::PROPERTY_VM_UUID;
use crate::aggregation::aggregate_throttling;
use crate::aggregation::UsageDataStrategy;
use crate::aggregation::UtilizationDataStrategy;
use crate::cluster::topology::NodeInfo;
use crate::cluster::topology::PodInfo;
use crate::cluster::topology::TopologySnapshot;
use crate::metrics::types::application_metric_id;
use crate::metrics::types::container_spec_id;
use crate::metrics::types::NODE_CACHE_USED;
use crate::metrics::EntityKind;
use crate::metrics::EntityMetricSink;
use crate::metrics::Point;
use crate::metrics::ResourceKind;
use crate::metrics::SampleKind;
use crate::metrics::SampleValue;
use crate::metrics::ThrottlingCumulative;

#[derive(Debug, Display)]
pub enum SnapshotError {
    #[display("snapshot violates supply-chain invariants: {}", violations.join("; "))]
    InvariantViolation { violations: Vec<String> },
}

impl Error for SnapshotError {}

pub struct SnapshotBuilder<'a> {
    topology: &'a TopologySnapshot,
    sink: &'a EntityMetricSink,
    utilization: UtilizationDataStrategy,
    usage: UsageDataStrategy,
    stitch_with_uuid: bool,
}

impl<'a> SnapshotBuilder<'a> {
    pub fn new(
        topology: &'a TopologySnapshot,
        sink: &'a EntityMetricSink,
        utilization: UtilizationDataStrategy,
        usage: UsageDataStrategy,
    ) -> Self {
        Self {
            topology,
            sink,
            utilization,
            usage,
            stitch_with_uuid: true,
        }
    }

    pub fn with_uuid_stitching(mut self, stitch_with_uuid: bool) -> Self {
        self.stitch_with_uuid = stitch_with_uuid;
        self
    }

    /// Assembles and validates the cycle's entity set. A validation
    /// failure aborts the cycle.
    pub fn build(&self) -> Result<Snapshot, SnapshotError> {
        let builder = GeneralBuilder::new(self.sink);
        let mut entities = Vec::new();

        let converters: HashMap<&str, FrequencyConverter> = self
            .topology
            .nodes
            .iter()
            .filter_map(|n| {
                self.sink
                    .get(
                        EntityKind::Node,
                        &n.name,
                        ResourceKind::CpuFrequency,
                        SampleKind::Used,
                    )
                    .and_then(|v| v.as_scalar())
                    .map(|mhz| (n.name.as_str(), FrequencyConverter::new(mhz)))
            })
            .collect();

        // Per node, the commodity types it actually sold this cycle;
        // pods must not buy what their node could not sell.
        let mut node_sold: HashMap<String, HashSet<CommodityType>> = HashMap::new();
        for node in &self.topology.nodes {
            let dto = self.node_dto(&builder, node, converters.get(node.name.as_str()));
            node_sold.insert(
                node.name.clone(),
                dto.sold.iter().map(|c| c.commodity_type).collect(),
            );
            entities.push(dto);
        }

        for pod in &self.topology.pods {
            let converter = pod
                .node_name
                .as_deref()
                .and_then(|n| converters.get(n));
            let sold_by_node = pod
                .node_name
                .as_deref()
                .and_then(|n| node_sold.get(n));
            let (pod_dto, container_dtos) =
                self.pod_dtos(&builder, pod, converter, sold_by_node);
            entities.push(pod_dto);
            entities.extend(container_dtos);
        }

        for spec in collect_container_spec_metrics(self.topology, self.sink) {
            entities.push(build_container_spec_dto(&spec, self.utilization, self.usage));
        }

        for controller in &self.topology.controllers {
            let mut dto = EntityDto::new(
                EntityKind::WorkloadController,
                controller.uid.clone(),
                format!("{}/{}", controller.namespace, controller.name),
            );
            dto.properties
                .push(EntityProperty::new(PROPERTY_CONTROLLER_KIND, controller.kind.clone()));
            if let Some(replicas) = controller.replicas {
                dto.properties
                    .push(EntityProperty::new("Replicas", replicas.to_string()));
            }
            entities.push(dto);
        }

        for namespace in &self.topology.namespaces {
            let mut dto = EntityDto::new(
                EntityKind::Namespace,
                namespace.uid.clone(),
                namespace.name.clone(),
            );
            if let Some(cpu) = namespace.quota_cpu_limit_milli {
                dto.properties
                    .push(EntityProperty::new("QuotaCpuLimitMillicores", cpu.to_string()));
            }
            if let Some(memory) = namespace.quota_memory_limit_kib {
                dto.properties
                    .push(EntityProperty::new("QuotaMemoryLimitKiB", memory.to_string()));
            }
            entities.push(dto);
        }

        entities.push(EntityDto::new(
            EntityKind::Cluster,
            self.topology.cluster_id.clone(),
            self.topology.cluster_name.clone(),
        ));

        let snapshot = Snapshot {
            cluster_id: self.topology.cluster_id.clone(),
            cluster_name: self.topology.cluster_name.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            entities,
        };

        let violations = validate_snapshot(&snapshot);
        if violations.is_empty() {
            Ok(snapshot)
        } else {
            Err(SnapshotError::InvariantViolation { violations })
        }
    }

    fn node_dto(
        &self,
        builder: &GeneralBuilder<'_>,
        node: &NodeInfo,
        converter: Option<&FrequencyConverter>,
    ) -> EntityDto {
        let mut dto = EntityDto::new(EntityKind::Node, node.uid.clone(), node.name.clone());

        let sold = [
            (ResourceKind::CpuMillicore, converter),
            (ResourceKind::Memory, None),
            (ResourceKind::VStorage, None),
            (ResourceKind::NumPods, None),
        ];
        for (resource, conv) in sold {
            match builder.sold_commodity_with_key(
                EntityKind::Node,
                &node.name,
                resource,
                None,
                conv,
                Some(self.utilization),
            ) {
                Ok(commodity) => dto.sold.push(commodity),
                Err(e) => debug!(node = %node.name, "skipping node commodity: {e}"),
            }
        }

        // Bootstrap commodity binding the node to its cluster.
        dto.sold.push(
            CommodityDto::new(CommodityType::Cluster, 1.0)
                .with_key(self.topology.cluster_id.clone())
                .with_capacity(f64::MAX),
        );

        dto.properties
            .push(EntityProperty::new(PROPERTY_NODE_NAME, node.name.clone()));
        for ip in &node.ip_addresses {
            dto.properties.push(EntityProperty::new(PROPERTY_VM_IP, ip.clone()));
        }
        if self.stitch_with_uuid && !node.system_uuid.is_empty() {
            dto.properties
                .push(EntityProperty::new(PROPERTY_VM_UUID, node.system_uuid.clone()));
        }
        if let Some(provider_id) = &node.provider_id {
            dto.properties
                .push(EntityProperty::new(PROPERTY_PROVIDER_ID, provider_id.clone()));
        }
        if self
            .sink
            .state(EntityKind::Node, &node.name, NODE_CACHE_USED)
            .is_some()
        {
            dto.properties
                .push(EntityProperty::new(PROPERTY_STALE_METRICS, "true"));
        }

        dto
    }

    fn pod_dtos(
        &self,
        builder: &GeneralBuilder<'_>,
        pod: &PodInfo,
        converter: Option<&FrequencyConverter>,
        sold_by_node: Option<&HashSet<CommodityType>>,
    ) -> (EntityDto, Vec<EntityDto>) {
        let pod_id = pod.metric_id();
        let mut dto = EntityDto::new(EntityKind::Pod, pod.uid.clone(), pod_id.clone());

        // Bought from the hosting node.
        if let Some(node) = pod.node_name.as_deref().and_then(|n| self.topology.node(n)) {
            let mut bought = Vec::new();
            for (resource, conv) in [
                (ResourceKind::CpuMillicore, converter),
                (ResourceKind::Memory, None),
                (ResourceKind::NumPods, None),
                (ResourceKind::VStorage, None),
            ] {
                let available = CommodityType::from_resource(resource)
                    .zip(sold_by_node)
                    .map(|(t, sold)| sold.contains(&t))
                    .unwrap_or(false);
                if !available {
                    debug!(pod = %pod_id, ?resource, "node does not sell commodity this cycle");
                    continue;
                }
                match builder.bought_commodity_with_key(
                    EntityKind::Pod,
                    &pod_id,
                    resource,
                    None,
                    conv,
                ) {
                    Ok(commodity) => bought.push(commodity),
                    Err(e) => debug!(pod = %pod_id, "skipping pod bought commodity: {e}"),
                }
            }
            if !bought.is_empty() {
                dto.bought.push(BoughtFromProvider {
                    provider_id: node.uid.clone(),
                    provider_kind: EntityKind::Node,
                    commodities: bought,
                });
            }
            dto.properties
                .push(EntityProperty::new(PROPERTY_NODE_NAME, node.name.clone()));
        }

        // Sold to this pod's containers, keyed by the pod UID.
        for (resource, conv) in [
            (ResourceKind::CpuMillicore, converter),
            (ResourceKind::Memory, None),
        ] {
            match builder.sold_commodity_with_key(
                EntityKind::Pod,
                &pod_id,
                resource,
                Some(&pod.uid),
                conv,
                Some(self.utilization),
            ) {
                Ok(commodity) => dto.sold.push(commodity),
                Err(e) => debug!(pod = %pod_id, "skipping pod sold commodity: {e}"),
            }
        }

        if let Some(controller) = &pod.controller {
            dto.properties.push(EntityProperty::new(
                PROPERTY_CONTROLLER_KIND,
                controller.kind.clone(),
            ));
        }

        let container_dtos = pod
            .containers
            .iter()
            .map(|c| self.container_dtos(builder, pod, &c.name, converter))
            .collect::<Vec<_>>()
            .into_iter()
            .flatten()
            .collect();

        (dto, container_dtos)
    }

    fn container_dtos(
        &self,
        builder: &GeneralBuilder<'_>,
        pod: &PodInfo,
        container_name: &str,
        converter: Option<&FrequencyConverter>,
    ) -> Vec<EntityDto> {
        let container_id = pod.container_metric_id(container_name);
        let entity_id = format!("{}/{}", pod.uid, container_name);
        let mut dto = EntityDto::new(EntityKind::Container, entity_id, container_id.clone());

        let mut bought = Vec::new();
        for (resource, conv) in [
            (ResourceKind::CpuMillicore, converter),
            (ResourceKind::Memory, None),
        ] {
            match builder.bought_commodity_with_key(
                EntityKind::Container,
                &container_id,
                resource,
                Some(&pod.uid),
                conv,
            ) {
                Ok(commodity) => bought.push(commodity),
                Err(e) => debug!(container = %container_id, "skipping container bought commodity: {e}"),
            }
        }
        if !bought.is_empty() {
            dto.bought.push(BoughtFromProvider {
                provider_id: pod.uid.clone(),
                provider_kind: EntityKind::Pod,
                commodities: bought,
            });
        }

        for (resource, conv) in [
            (ResourceKind::CpuMillicore, converter),
            (ResourceKind::Memory, None),
        ] {
            match builder.sold_commodity_with_key(
                EntityKind::Container,
                &container_id,
                resource,
                Some(&container_id),
                conv,
                Some(self.utilization),
            ) {
                Ok(mut commodity) => {
                    commodity.resizable = true;
                    dto.sold.push(commodity);
                }
                Err(e) => debug!(container = %container_id, "skipping container sold commodity: {e}"),
            }
        }

        // The application running inside the container.
        let app_id = application_metric_id(&container_id);
        let mut app = EntityDto::new(EntityKind::Application, app_id.clone(), app_id.clone());
        let mut app_bought = Vec::new();
        for (resource, conv) in [
            (ResourceKind::CpuMillicore, converter),
            (ResourceKind::Memory, None),
        ] {
            match builder.bought_commodity_with_key(
                EntityKind::Application,
                &app_id,
                resource,
                Some(&container_id),
                conv,
            ) {
                Ok(commodity) => app_bought.push(commodity),
                Err(e) => debug!(app = %app_id, "skipping application bought commodity: {e}"),
            }
        }
        if !app_bought.is_empty() {
            app.bought.push(BoughtFromProvider {
                provider_id: dto.id.clone(),
                provider_kind: EntityKind::Container,
                commodities: app_bought,
            });
        }

        vec![dto, app]
    }
}

/// Pooled per-replica samples for one `(controller, container name)`
/// aggregate.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpecMetrics {
    pub namespace: String,
    pub controller_uid: String,
    pub controller_name: String,
    pub container_name: String,
    pub replicas: usize,
    pub cpu_capacities: Vec<f64>,
    pub cpu_used: Vec<Point>,
    pub memory_capacities: Vec<f64>,
    pub memory_used: Vec<Point>,
    pub cpu_request_capacities: Vec<f64>,
    pub cpu_request_used: Vec<Point>,
    pub memory_request_capacities: Vec<f64>,
    pub memory_request_used: Vec<Point>,
    pub throttling: Vec<Vec<ThrottlingCumulative>>,
}

impl ContainerSpecMetrics {
    pub fn spec_id(&self) -> String {
        container_spec_id(&self.controller_uid, &self.container_name)
    }
}

/// Groups all containers by `(controller UID, container name)` and pools
/// their sample rings. Bare pods are not aggregated.
pub fn collect_container_spec_metrics(
    topology: &TopologySnapshot,
    sink: &EntityMetricSink,
) -> Vec<ContainerSpecMetrics> {
    let mut specs: HashMap<String, ContainerSpecMetrics> = HashMap::new();

    for pod in &topology.pods {
        let Some(controller) = &pod.controller else {
            continue;
        };
        let node = pod.node_name.as_deref().and_then(|n| topology.node(n));

        for container in &pod.containers {
            let key = container_spec_id(&controller.uid, &container.name);
            let spec = specs.entry(key).or_insert_with(|| ContainerSpecMetrics {
                namespace: pod.namespace.clone(),
                controller_uid: controller.uid.clone(),
                controller_name: controller.name.clone(),
                container_name: container.name.clone(),
                ..Default::default()
            });
            spec.replicas += 1;

            let container_id = pod.container_metric_id(&container.name);

            let cpu_capacity = container
                .limit_cpu_milli
                .or(node.map(|n| n.allocatable_cpu_milli));
            if let Some(capacity) = cpu_capacity {
                spec.cpu_capacities.push(capacity);
            }
            let memory_capacity = container
                .limit_memory_kib
                .or(node.map(|n| n.allocatable_memory_kib));
            if let Some(capacity) = memory_capacity {
                spec.memory_capacities.push(capacity);
            }
            if let Some(request) = container.request_cpu_milli {
                spec.cpu_request_capacities.push(request);
            }
            if let Some(request) = container.request_memory_kib {
                spec.memory_request_capacities.push(request);
            }

            let pull_points = |resource: ResourceKind| -> Vec<Point> {
                match sink.get(EntityKind::Container, &container_id, resource, SampleKind::Used) {
                    Some(SampleValue::Points(points)) => points,
                    _ => Vec::new(),
                }
            };
            spec.cpu_used.extend(pull_points(ResourceKind::CpuMillicore));
            spec.memory_used.extend(pull_points(ResourceKind::Memory));
            spec.cpu_request_used
                .extend(pull_points(ResourceKind::CpuRequest));
            spec.memory_request_used
                .extend(pull_points(ResourceKind::MemoryRequest));

            if let Some(SampleValue::Throttling(samples)) = sink.get(
                EntityKind::Container,
                &container_id,
                ResourceKind::VcpuThrottling,
                SampleKind::Used,
            ) {
                spec.throttling.push(samples);
            }
        }
    }

    let mut specs: Vec<ContainerSpecMetrics> = specs.into_values().collect();
    specs.sort_by(|a, b| a.spec_id().cmp(&b.spec_id()));
    specs
}

/// Builds the ContainerSpec entity DTO from pooled replica samples.
pub fn build_container_spec_dto(
    spec: &ContainerSpecMetrics,
    utilization: UtilizationDataStrategy,
    usage: UsageDataStrategy,
) -> EntityDto {
    let mut dto = EntityDto::new(
        EntityKind::ContainerSpec,
        spec.spec_id(),
        format!("{}/{}", spec.controller_name, spec.container_name),
    );
    dto.properties
        .push(EntityProperty::new("Namespace", spec.namespace.clone()));
    dto.properties
        .push(EntityProperty::new("Replicas", spec.replicas.to_string()));

    let commodities = [
        (CommodityType::VCpu, &spec.cpu_used, &spec.cpu_capacities),
        (CommodityType::VMem, &spec.memory_used, &spec.memory_capacities),
        (
            CommodityType::VCpuRequest,
            &spec.cpu_request_used,
            &spec.cpu_request_capacities,
        ),
        (
            CommodityType::VMemRequest,
            &spec.memory_request_used,
            &spec.memory_request_capacities,
        ),
    ];
    for (commodity_type, used, capacities) in commodities {
        match usage.aggregate(used, capacities) {
            Ok(data) => {
                let mut commodity = CommodityDto::new(commodity_type, data.used)
                    .with_peak(data.peak)
                    .with_capacity(data.capacity);
                commodity.resizable = true;
                commodity.utilization_points = utilization.aggregate(used, data.capacity);
                dto.sold.push(commodity);
            }
            Err(e) => {
                debug!(spec = %dto.display_name, "skipping container spec commodity: {e}");
            }
        }
    }

    if let Some((avg, peak)) = aggregate_throttling(&spec.throttling) {
        let mut commodity = CommodityDto::new(CommodityType::VCpuThrottling, avg)
            .with_peak(peak)
            .with_capacity(100.0);
        commodity.resizable = true;
        dto.sold.push(commodity);
    }

    dto
}

/// Seeds capacity samples derived from the indexed topology into the
/// sink so the commodity builders find used and capacity under the same
/// protocol.
pub fn seed_capacity_samples(topology: &TopologySnapshot, sink: &EntityMetricSink) {
    let pods_by_node = topology.pods_by_node();

    for node in &topology.nodes {
        sink.add(
            EntityKind::Node,
            &node.name,
            ResourceKind::CpuMillicore,
            SampleKind::Capacity,
            SampleValue::Scalar(node.allocatable_cpu_milli),
        );
        sink.add(
            EntityKind::Node,
            &node.name,
            ResourceKind::Memory,
            SampleKind::Capacity,
            SampleValue::Scalar(node.allocatable_memory_kib),
        );
        sink.add(
            EntityKind::Node,
            &node.name,
            ResourceKind::NumPods,
            SampleKind::Capacity,
            SampleValue::Scalar(node.allocatable_pods),
        );
        let pod_count = pods_by_node
            .get(node.name.as_str())
            .map(|pods| pods.len())
            .unwrap_or(0);
        sink.add(
            EntityKind::Node,
            &node.name,
            ResourceKind::NumPods,
            SampleKind::Used,
            SampleValue::Scalar(pod_count as f64),
        );
    }

    for pod in &topology.pods {
        let node = pod.node_name.as_deref().and_then(|n| topology.node(n));
        let pod_id = pod.metric_id();

        let sum_or_allocatable = |limits: Vec<Option<f64>>, allocatable: Option<f64>| -> f64 {
            if limits.iter().all(|l| l.is_some()) && !limits.is_empty() {
                limits.into_iter().flatten().sum()
            } else {
                allocatable.unwrap_or(0.0)
            }
        };

        let cpu_capacity = sum_or_allocatable(
            pod.containers.iter().map(|c| c.limit_cpu_milli).collect(),
            node.map(|n| n.allocatable_cpu_milli),
        );
        let memory_capacity = sum_or_allocatable(
            pod.containers.iter().map(|c| c.limit_memory_kib).collect(),
            node.map(|n| n.allocatable_memory_kib),
        );
        sink.add(
            EntityKind::Pod,
            &pod_id,
            ResourceKind::CpuMillicore,
            SampleKind::Capacity,
            SampleValue::Scalar(cpu_capacity),
        );
        sink.add(
            EntityKind::Pod,
            &pod_id,
            ResourceKind::Memory,
            SampleKind::Capacity,
            SampleValue::Scalar(memory_capacity),
        );

        for container in &pod.containers {
            let container_id = pod.container_metric_id(&container.name);
            let cpu = container
                .limit_cpu_milli
                .or(node.map(|n| n.allocatable_cpu_milli))
                .unwrap_or(0.0);
            let memory = container
                .limit_memory_kib
                .or(node.map(|n| n.allocatable_memory_kib))
                .unwrap_or(0.0);
            sink.add(
                EntityKind::Container,
                &container_id,
                ResourceKind::CpuMillicore,
                SampleKind::Capacity,
                SampleValue::Scalar(cpu),
            );
            sink.add(
                EntityKind::Container,
                &container_id,
                ResourceKind::Memory,
                SampleKind::Capacity,
                SampleValue::Scalar(memory),
            );
        }
    }
}

/// Checks the supply-chain invariants: every bought commodity must have
/// a matching sold commodity on its provider (bootstrap cluster
/// commodities excepted), and `used <= peak <= capacity` wherever all
/// three are present.
pub fn validate_snapshot(snapshot: &Snapshot) -> Vec<String> {
    const EPSILON: f64 = 1e-6;
    let mut violations = Vec::new();

    let mut sold_index: HashMap<&str, HashSet<(CommodityType, Option<&str>)>> = HashMap::new();
    for entity in &snapshot.entities {
        let entry = sold_index.entry(entity.id.as_str()).or_default();
        for commodity in &entity.sold {
            entry.insert((commodity.commodity_type, commodity.key.as_deref()));
        }
    }

    for entity in &snapshot.entities {
        for bought in &entity.bought {
            let Some(provider_sold) = sold_index.get(bought.provider_id.as_str()) else {
                violations.push(format!(
                    "{} buys from unknown provider {}",
                    entity.id, bought.provider_id
                ));
                continue;
            };
            for commodity in &bought.commodities {
                if commodity.commodity_type == CommodityType::Cluster {
                    continue;
                }
                let matched = provider_sold.iter().any(|(t, key)| {
                    *t == commodity.commodity_type
                        && (commodity.key.is_none() || commodity.key.as_deref() == *key)
                });
                if !matched {
                    violations.push(format!(
                        "{} buys {:?} (key {:?}) not sold by provider {}",
                        entity.id, commodity.commodity_type, commodity.key, bought.provider_id
                    ));
                }
            }
        }

        for commodity in &entity.sold {
            if let (used, Some(peak), Some(capacity)) =
                (commodity.used, commodity.peak, commodity.capacity)
            {
                if used > peak + EPSILON || peak > capacity + EPSILON {
                    violations.push(format!(
                        "{} sold {:?} breaks used <= peak <= capacity ({} / {} / {})",
                        entity.id, commodity.commodity_type, used, peak, capacity
                    ));
                }
            }
        }
    }

    if !violations.is_empty() {
        warn!(count = violations.len(), "snapshot validation failed");
    }
    violations
}

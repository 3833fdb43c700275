//! Acquisition chain: the trigger tree of acquisition objects.
//!
//! Every node has at most one master. Roots are top-level masters; each of
//! them gets its own [`ChainIterator`] when a scan runs. Names are unique
//! inside a chain and serve as node identity.
//!
//! The chain can be shared read-only between several scans. The first scan
//! that starts running freezes it; later edits are structural errors.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use daq_core::{AcquisitionChannel, AcquisitionObject, ChannelShape, DaqError, DaqResult};
use parking_lot::RwLock;
use serde_json::{json, Map, Value};

use crate::iterator::{ChainIterator, IterNode};

struct ChainNode {
    object: Arc<dyn AcquisitionObject>,
    parent: Option<usize>,
    children: Vec<usize>,
}

fn same_object(a: &Arc<dyn AcquisitionObject>, b: &Arc<dyn AcquisitionObject>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Ordered trigger tree of acquisition objects.
#[derive(Default)]
pub struct AcquisitionChain {
    nodes: RwLock<Vec<ChainNode>>,
    frozen: AtomicBool,
}

impl AcquisitionChain {
    /// Empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    fn check_editable(&self) -> DaqResult<()> {
        if self.frozen.load(Ordering::Acquire) {
            return Err(DaqError::InvalidChain(
                "chain topology is frozen, a scan using it has already started".into(),
            ));
        }
        Ok(())
    }

    /// Find `object` by name, or insert it as a new root.
    fn intern(nodes: &mut Vec<ChainNode>, object: &Arc<dyn AcquisitionObject>) -> DaqResult<usize> {
        if let Some(idx) = nodes.iter().position(|n| n.object.name() == object.name()) {
            if !same_object(&nodes[idx].object, object) {
                return Err(DaqError::InvalidChain(format!(
                    "duplicated acquisition object name '{}'",
                    object.name()
                )));
            }
            return Ok(idx);
        }
        nodes.push(ChainNode {
            object: object.clone(),
            parent: None,
            children: Vec::new(),
        });
        Ok(nodes.len() - 1)
    }

    /// Register a top-level master with no children (yet).
    pub fn add_master(&self, master: Arc<dyn AcquisitionObject>) -> DaqResult<()> {
        self.check_editable()?;
        let mut nodes = self.nodes.write();
        Self::intern(&mut nodes, &master)?;
        Ok(())
    }

    /// Register a `master -> child` trigger edge.
    ///
    /// A child that is currently a root is moved under `master`. A child that
    /// already has a different master, an edge that would close a cycle, or a
    /// second object reusing a known name is rejected.
    pub fn add(
        &self,
        master: Arc<dyn AcquisitionObject>,
        child: Arc<dyn AcquisitionObject>,
    ) -> DaqResult<()> {
        self.check_editable()?;
        if master.name() == child.name() {
            return Err(DaqError::InvalidChain(format!(
                "'{}' cannot trigger itself",
                master.name()
            )));
        }

        let mut nodes = self.nodes.write();
        let master_idx = Self::intern(&mut nodes, &master)?;

        let existing = nodes.iter().position(|n| n.object.name() == child.name());
        let child_idx = match existing {
            Some(idx) => {
                if !same_object(&nodes[idx].object, &child) {
                    return Err(DaqError::InvalidChain(format!(
                        "duplicated acquisition object name '{}'",
                        child.name()
                    )));
                }
                match nodes[idx].parent {
                    Some(parent) if parent == master_idx => return Ok(()),
                    Some(_) => {
                        return Err(DaqError::InvalidChain(format!(
                            "cannot add acquisition device '{}' to multiple masters",
                            child.name()
                        )));
                    }
                    None => {}
                }
                let mut cursor = Some(master_idx);
                while let Some(idx_up) = cursor {
                    if idx_up == idx {
                        return Err(DaqError::InvalidChain(format!(
                            "adding '{}' under '{}' would create a cycle",
                            child.name(),
                            master.name()
                        )));
                    }
                    cursor = nodes[idx_up].parent;
                }
                idx
            }
            None => {
                nodes.push(ChainNode {
                    object: child.clone(),
                    parent: None,
                    children: Vec::new(),
                });
                nodes.len() - 1
            }
        };

        nodes[child_idx].parent = Some(master_idx);
        nodes[master_idx].children.push(child_idx);
        Ok(())
    }

    /// Forbid further edits.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    /// Whether a scan froze the topology.
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Number of objects.
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    /// True for an empty chain.
    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Top-level masters in insertion order.
    pub fn top_masters(&self) -> Vec<Arc<dyn AcquisitionObject>> {
        self.nodes
            .read()
            .iter()
            .filter(|n| n.parent.is_none())
            .map(|n| n.object.clone())
            .collect()
    }

    /// Master of the object named `name`.
    pub fn master_of(&self, name: &str) -> Option<Arc<dyn AcquisitionObject>> {
        let nodes = self.nodes.read();
        let node = nodes.iter().find(|n| n.object.name() == name)?;
        node.parent.map(|p| nodes[p].object.clone())
    }

    /// Breadth-first indices of the subtree rooted at `root`, with depth.
    fn subtree(nodes: &[ChainNode], root: usize) -> Vec<(usize, usize)> {
        let mut order = vec![(root, 0)];
        let mut cursor = 0;
        while cursor < order.len() {
            let (idx, depth) = order[cursor];
            for &child in &nodes[idx].children {
                order.push((child, depth + 1));
            }
            cursor += 1;
        }
        order
    }

    fn roots(nodes: &[ChainNode]) -> Vec<usize> {
        (0..nodes.len()).filter(|&i| nodes[i].parent.is_none()).collect()
    }

    /// Every object, grouped by top-level master, breadth first.
    pub fn objects(&self) -> Vec<Arc<dyn AcquisitionObject>> {
        let nodes = self.nodes.read();
        Self::roots(&nodes)
            .into_iter()
            .flat_map(|root| Self::subtree(&nodes, root))
            .map(|(idx, _)| nodes[idx].object.clone())
            .collect()
    }

    /// Every channel of every object, in `objects()` order.
    pub fn channels(&self) -> Vec<Arc<AcquisitionChannel>> {
        self.objects()
            .into_iter()
            .flat_map(|object| object.channels())
            .collect()
    }

    /// One iterator per top-level master.
    pub fn iterators(&self) -> Vec<ChainIterator> {
        let nodes = self.nodes.read();
        Self::roots(&nodes)
            .into_iter()
            .map(|root| {
                let order = Self::subtree(&nodes, root);
                let local: HashMap<usize, usize> = order
                    .iter()
                    .enumerate()
                    .map(|(pos, (idx, _))| (*idx, pos))
                    .collect();
                let iter_nodes = order
                    .iter()
                    .map(|&(idx, depth)| IterNode {
                        object: nodes[idx].object.clone(),
                        depth,
                        children: nodes[idx]
                            .children
                            .iter()
                            .filter_map(|c| local.get(c).copied())
                            .collect(),
                    })
                    .collect();
                ChainIterator::new(iter_nodes)
            })
            .collect()
    }

    /// Channel grouping published as `scan_info["acquisition_chain"]`.
    ///
    /// For each top-level master: the master's own channels under `master`,
    /// every other channel of its subtree in the flat lists, split by shape
    /// into `scalars`, `spectra` and `images`, plus `scalars_units` and
    /// `display_names` (short name when unique, else the device name when
    /// the device has a single channel, else the full name).
    pub fn describe(&self) -> Value {
        let nodes = self.nodes.read();

        let mut short_counts: HashMap<String, usize> = HashMap::new();
        let mut device_counts: HashMap<String, usize> = HashMap::new();
        for node in nodes.iter() {
            for channel in node.object.channels() {
                *short_counts.entry(channel.name().to_string()).or_default() += 1;
                *device_counts.entry(channel.device().to_string()).or_default() += 1;
            }
        }

        let mut description = Map::new();
        for root in Self::roots(&nodes) {
            let mut master_group = ChannelGroup::default();
            let mut group = ChannelGroup::default();
            for (idx, _) in Self::subtree(&nodes, root) {
                let target = if idx == root {
                    &mut master_group
                } else {
                    &mut group
                };
                for channel in nodes[idx].object.channels() {
                    let display = if short_counts.get(channel.name()) == Some(&1) {
                        channel.name().to_string()
                    } else if device_counts.get(channel.device()) == Some(&1) {
                        channel.device().to_string()
                    } else {
                        channel.fullname()
                    };
                    target.push(&channel, display);
                }
            }
            let mut entry = group.into_map();
            entry.insert("master".into(), Value::Object(master_group.into_map()));
            description.insert(
                nodes[root].object.name().to_string(),
                Value::Object(entry),
            );
        }
        Value::Object(description)
    }
}

impl std::fmt::Debug for AcquisitionChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let nodes = self.nodes.read();
        let edges: Vec<String> = nodes
            .iter()
            .map(|n| match n.parent {
                Some(p) => format!("{} -> {}", nodes[p].object.name(), n.object.name()),
                None => n.object.name().to_string(),
            })
            .collect();
        f.debug_struct("AcquisitionChain")
            .field("nodes", &edges)
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

#[derive(Default)]
struct ChannelGroup {
    scalars: Vec<String>,
    spectra: Vec<String>,
    images: Vec<String>,
    units: BTreeMap<String, Value>,
    display_names: BTreeMap<String, String>,
}

impl ChannelGroup {
    fn push(&mut self, channel: &AcquisitionChannel, display: String) {
        let fullname = channel.fullname();
        let list = match channel.shape() {
            ChannelShape::Scalar => &mut self.scalars,
            ChannelShape::Spectrum => &mut self.spectra,
            ChannelShape::Image => &mut self.images,
        };
        if list.contains(&fullname) {
            return;
        }
        list.push(fullname.clone());
        if channel.shape() == ChannelShape::Scalar {
            self.units.insert(
                fullname.clone(),
                channel.unit().map(Value::from).unwrap_or(Value::Null),
            );
        }
        self.display_names.insert(fullname, display);
    }

    fn into_map(self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("scalars".into(), json!(self.scalars));
        map.insert("spectra".into(), json!(self.spectra));
        map.insert("images".into(), json!(self.images));
        map.insert("scalars_units".into(), json!(self.units));
        map.insert("display_names".into(), json!(self.display_names));
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use daq_core::{AcqContext, DataType};

    struct Node {
        name: String,
        channels: Vec<Arc<AcquisitionChannel>>,
    }

    impl Node {
        fn new(name: &str) -> Arc<dyn AcquisitionObject> {
            Arc::new(Self {
                name: name.into(),
                channels: Vec::new(),
            })
        }

        fn with_channels(name: &str, channels: Vec<AcquisitionChannel>) -> Arc<dyn AcquisitionObject> {
            Arc::new(Self {
                name: name.into(),
                channels: channels.into_iter().map(Arc::new).collect(),
            })
        }
    }

    #[async_trait]
    impl AcquisitionObject for Node {
        fn name(&self) -> &str {
            &self.name
        }
        fn channels(&self) -> Vec<Arc<AcquisitionChannel>> {
            self.channels.clone()
        }
        async fn prepare(&self, _ctx: &AcqContext) -> Result<()> {
            Ok(())
        }
        async fn start(&self, _ctx: &AcqContext) -> Result<()> {
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_add_builds_tree() {
        let chain = AcquisitionChain::new();
        let timer = Node::new("timer");
        let mca = Node::new("mca");
        let diode = Node::new("diode");
        chain.add(timer.clone(), mca.clone()).unwrap();
        chain.add(timer.clone(), diode.clone()).unwrap();
        // same edge twice is harmless
        chain.add(timer.clone(), diode.clone()).unwrap();

        assert_eq!(chain.len(), 3);
        assert_eq!(chain.top_masters().len(), 1);
        assert_eq!(chain.master_of("diode").unwrap().name(), "timer");
        assert_eq!(chain.iterators().len(), 1);
    }

    #[test]
    fn test_root_can_be_moved_under_master() {
        let chain = AcquisitionChain::new();
        let m0 = Node::new("m0");
        let timer = Node::new("timer");
        let diode = Node::new("diode");
        chain.add(timer.clone(), diode).unwrap();
        chain.add(m0.clone(), timer.clone()).unwrap();

        let names: Vec<_> = chain.objects().iter().map(|o| o.name().to_string()).collect();
        assert_eq!(names, vec!["m0", "timer", "diode"]);
        assert_eq!(chain.top_masters().len(), 1);
    }

    #[test]
    fn test_multiple_masters_rejected() {
        let chain = AcquisitionChain::new();
        let a = Node::new("a");
        let b = Node::new("b");
        let leaf = Node::new("leaf");
        chain.add(a, leaf.clone()).unwrap();
        let err = chain.add(b, leaf).unwrap_err();
        assert!(err.to_string().contains("multiple masters"));
    }

    #[test]
    fn test_cycle_and_duplicate_name_rejected() {
        let chain = AcquisitionChain::new();
        let a = Node::new("a");
        let b = Node::new("b");
        chain.add(a.clone(), b.clone()).unwrap();
        assert!(chain.add(b.clone(), a.clone()).is_err());
        assert!(chain.add(a.clone(), a.clone()).is_err());

        let imposter = Node::new("b");
        let err = chain.add(a, imposter).unwrap_err();
        assert!(err.to_string().contains("duplicated"));
    }

    #[test]
    fn test_frozen_chain_rejects_edits() {
        let chain = AcquisitionChain::new();
        chain.add_master(Node::new("timer")).unwrap();
        chain.freeze();
        let err = chain.add(Node::new("timer2"), Node::new("x")).unwrap_err();
        assert!(matches!(err, DaqError::InvalidChain(_)));
    }

    #[test]
    fn test_describe_groups_by_master_and_shape() {
        let chain = AcquisitionChain::new();
        let timer = Node::with_channels(
            "timer",
            vec![AcquisitionChannel::scalar("timer", "elapsed_time").with_unit("s")],
        );
        let mca = Node::with_channels(
            "mca",
            vec![AcquisitionChannel::new(
                "mca",
                "spectrum",
                ChannelShape::Spectrum,
                DataType::Float64,
            )],
        );
        let d1 = Node::with_channels("d1", vec![AcquisitionChannel::scalar("d1", "counts")]);
        let d2 = Node::with_channels("d2", vec![AcquisitionChannel::scalar("d2", "counts")]);
        chain.add(timer.clone(), mca).unwrap();
        chain.add(timer.clone(), d1).unwrap();
        chain.add(timer, d2).unwrap();

        let description = chain.describe();
        let timer = &description["timer"];
        assert_eq!(timer["master"]["scalars"], json!(["timer:elapsed_time"]));
        assert_eq!(timer["master"]["scalars_units"]["timer:elapsed_time"], json!("s"));
        assert_eq!(timer["spectra"], json!(["mca:spectrum"]));
        assert_eq!(timer["scalars"], json!(["d1:counts", "d2:counts"]));
        assert_eq!(timer["display_names"]["d1:counts"], json!("d1"));
        assert_eq!(timer["display_names"]["mca:spectrum"], json!("spectrum"));
    }
}

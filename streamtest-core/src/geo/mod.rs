//! Proximity ranking of candidate playback nodes.
//!
//! Nodes that share a location key are treated as one group: the group is
//! either selected as a whole or not at all, so co-located replicas never end
//! up on different sides of the cut.

mod source;

use std::cmp::Ordering;
use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

pub use source::{node_source_from_spec, FileNodeSource, HttpNodeSource, NodeSource};

pub const EARTH_RADIUS_KM: f64 = 6371.0;

pub const LATITUDE_TAG: &str = "latitude";
pub const LONGITUDE_TAG: &str = "longitude";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Great-circle distance in kilometres between two points given in degrees.
pub fn haversine_km(a: Coordinates, b: Coordinates) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let delta_lat = (b.latitude - a.latitude).to_radians();
    let delta_lon = (b.longitude - a.longitude).to_radians();

    let h = (delta_lat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}

const GROUPING_SCALE: f64 = 1000.0;

// Adding 0.0 turns -0.0 into 0.0 so both sides of the equator share a key.
fn snap(degrees: f64) -> f64 {
    (degrees * GROUPING_SCALE).round() / GROUPING_SCALE + 0.0
}

/// A candidate remote endpoint as reported by the membership source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoNode {
    pub name: String,
    #[serde(default)]
    pub addr: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl GeoNode {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            tags: BTreeMap::new(),
        }
    }

    pub fn with_location(mut self, latitude: impl Into<String>, longitude: impl Into<String>) -> Self {
        self.tags.insert(LATITUDE_TAG.to_string(), latitude.into());
        self.tags.insert(LONGITUDE_TAG.to_string(), longitude.into());
        self
    }

    fn raw_location(&self) -> (&str, &str) {
        (
            self.tags.get(LATITUDE_TAG).map(String::as_str).unwrap_or(""),
            self.tags.get(LONGITUDE_TAG).map(String::as_str).unwrap_or(""),
        )
    }

    /// Parsed location, `None` when either tag is missing or malformed.
    pub fn coordinates(&self) -> Option<Coordinates> {
        let (lat, lon) = self.raw_location();
        let latitude = lat.trim().parse::<f64>().ok()?;
        let longitude = lon.trim().parse::<f64>().ok()?;
        if latitude.is_finite() && longitude.is_finite() {
            Some(Coordinates::new(latitude, longitude))
        } else {
            None
        }
    }

    /// Location snapped to the grouping grid. Every node of a group has the
    /// same snapped location.
    pub fn grouped_coordinates(&self) -> Option<Coordinates> {
        self.coordinates()
            .map(|c| Coordinates::new(snap(c.latitude), snap(c.longitude)))
    }

    /// Grouping key: rounded coordinates when parseable, raw tags otherwise.
    pub fn location_key(&self) -> String {
        match self.grouped_coordinates() {
            Some(c) => format!("{:.3}:{:.3}", c.latitude, c.longitude),
            None => {
                let (lat, lon) = self.raw_location();
                format!("raw:{lat}:{lon}")
            }
        }
    }

    /// Distance from `origin` to the node's group location, NaN when the node
    /// has no usable location. Co-located nodes are equally distant.
    pub fn distance_from(&self, origin: Coordinates) -> f64 {
        self.grouped_coordinates()
            .map(|c| haversine_km(origin, c))
            .unwrap_or(f64::NAN)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeGroup {
    pub key: String,
    pub distance_km: f64,
    pub nodes: Vec<GeoNode>,
}

fn compare_distance(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

/// Groups candidates by location and orders the groups nearest first.
/// Groups with an undefined distance sort last; ties keep first-seen order.
pub fn rank_groups(candidates: &[GeoNode], origin: Coordinates) -> Vec<NodeGroup> {
    let mut groups: Vec<NodeGroup> = Vec::new();
    for node in candidates {
        let key = node.location_key();
        match groups.iter_mut().find(|group| group.key == key) {
            Some(group) => group.nodes.push(node.clone()),
            None => groups.push(NodeGroup {
                distance_km: node.distance_from(origin),
                key,
                nodes: vec![node.clone()],
            }),
        }
    }
    groups.sort_by(|a, b| compare_distance(a.distance_km, b.distance_km));
    groups
}

/// Returns candidates nearest first, accumulating whole location groups
/// until at least `want` nodes are collected. The final group is never
/// truncated, so the result may exceed `want`.
pub fn select_closest(candidates: &[GeoNode], origin: Coordinates, want: usize) -> Vec<GeoNode> {
    let mut selected = Vec::new();
    for group in rank_groups(candidates, origin) {
        if selected.len() >= want {
            break;
        }
        selected.extend(group.nodes);
    }
    selected
}

/// Per-cycle node choice: the nearest nodes, then the subset playback is
/// pulled from.
#[derive(Debug, Clone, Serialize)]
pub struct GeoPlan {
    pub origin: Coordinates,
    pub closest: Vec<GeoNode>,
    pub pull: Vec<GeoNode>,
}

impl GeoPlan {
    pub fn build(
        members: &[GeoNode],
        origin: Coordinates,
        node_count: usize,
        pull_count: usize,
        random_member: bool,
    ) -> Self {
        let closest = select_closest(members, origin, node_count);
        let pull = if random_member {
            let mut rng = rand::thread_rng();
            closest
                .choose_multiple(&mut rng, pull_count)
                .cloned()
                .collect()
        } else {
            closest.iter().take(pull_count).cloned().collect()
        };
        Self {
            origin,
            closest,
            pull,
        }
    }

    pub fn empty(origin: Coordinates) -> Self {
        Self {
            origin,
            closest: Vec::new(),
            pull: Vec::new(),
        }
    }
}

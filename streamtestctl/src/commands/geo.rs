use std::path::PathBuf;

use clap::Args;
use serde::Serialize;
use streamtest_core::{rank_groups, Coordinates, FileNodeSource, GeoPlan, NodeGroup, NodeSource};
use tokio_util::sync::CancellationToken;

use crate::{DisplayFallback, Result};

/// Ranks the nodes of a membership file by distance from an origin.
#[derive(Args, Debug, Clone)]
pub struct GeoRankArgs {
    /// JSON membership list (name, addr, tags.latitude, tags.longitude)
    #[arg(long, value_name = "FILE", default_value = "configs/nodes.json")]
    pub nodes: PathBuf,
    /// Origin latitude in degrees
    #[arg(long, allow_hyphen_values = true, default_value_t = 0.0)]
    pub lat: f64,
    /// Origin longitude in degrees
    #[arg(long, allow_hyphen_values = true, default_value_t = 0.0)]
    pub lon: f64,
    /// Number of nodes wanted; co-located nodes are never split
    #[arg(long, default_value_t = 5)]
    pub count: usize,
    /// Number of selected nodes playback would be pulled from
    #[arg(long, default_value_t = 1)]
    pub pull: usize,
}

#[derive(Debug, Serialize)]
pub struct GeoRanking {
    pub origin: Coordinates,
    pub groups: Vec<NodeGroup>,
    pub plan: GeoPlan,
}

pub async fn rank(args: &GeoRankArgs) -> Result<GeoRanking> {
    let members = FileNodeSource::new(&args.nodes)
        .members(&CancellationToken::new())
        .await?;
    let origin = Coordinates::new(args.lat, args.lon);
    Ok(GeoRanking {
        origin,
        groups: rank_groups(&members, origin),
        plan: GeoPlan::build(&members, origin, args.count, args.pull, false),
    })
}

impl DisplayFallback for GeoRanking {
    fn display(&self) -> String {
        if self.groups.is_empty() {
            return "no candidate nodes".to_string();
        }
        let mut lines = vec![format!(
            "origin {:.4},{:.4}",
            self.origin.latitude, self.origin.longitude
        )];
        for group in &self.groups {
            let distance = if group.distance_km.is_nan() {
                "-".to_string()
            } else {
                format!("{:.0} km", group.distance_km)
            };
            let names: Vec<&str> = group.nodes.iter().map(|node| node.name.as_str()).collect();
            lines.push(format!("{distance:>9}  {}  [{}]", group.key, names.join(", ")));
        }
        let selected: Vec<&str> = self.plan.closest.iter().map(|n| n.name.as_str()).collect();
        let pulled: Vec<&str> = self.plan.pull.iter().map(|n| n.name.as_str()).collect();
        lines.push(format!("selected: {}", selected.join(", ")));
        lines.push(format!("pull: {}", pulled.join(", ")));
        lines.join("\n")
    }
}

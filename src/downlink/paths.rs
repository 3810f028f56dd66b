//! Downlink path candidates
//!
//! Answers to an uplink go out through the antennas that received it,
//! best link first. Gateways that must not transmit, or that did not leave
//! an uplink token, are skipped.

use std::cmp::Ordering;

use crate::messages::{DownlinkPath, DownlinkPathConstraint, GatewayAntennaIds, RxMetadata};

fn constraint_rank(c: DownlinkPathConstraint) -> u8 {
    match c {
        DownlinkPathConstraint::None => 0,
        DownlinkPathConstraint::PreferOther => 1,
        DownlinkPathConstraint::Never => 2,
    }
}

fn compare(a: &RxMetadata, b: &RxMetadata) -> Ordering {
    constraint_rank(a.downlink_path_constraint)
        .cmp(&constraint_rank(b.downlink_path_constraint))
        .then_with(|| b.snr.total_cmp(&a.snr))
        .then_with(|| b.rssi.total_cmp(&a.rssi))
}

/// Paths through the antennas in `rx_metadata`, best first
pub fn paths_from_metadata(rx_metadata: &[RxMetadata]) -> Vec<DownlinkPath> {
    let mut usable: Vec<&RxMetadata> = rx_metadata
        .iter()
        .filter(|md| !md.uplink_token.is_empty())
        .filter(|md| md.downlink_path_constraint != DownlinkPathConstraint::Never)
        .collect();
    usable.sort_by(|a, b| compare(a, b));
    usable
        .into_iter()
        .map(|md| DownlinkPath::UplinkToken {
            gateway_ids: md.gateway_ids.clone(),
            token: md.uplink_token.clone(),
        })
        .collect()
}

/// Paths through configured antennas, in the given order
pub fn fixed_paths(gateways: &[GatewayAntennaIds]) -> Vec<DownlinkPath> {
    gateways.iter().cloned().map(DownlinkPath::Fixed).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::device::GatewayIds;

    fn md(gw: &str, snr: f32, rssi: f32, token: &[u8]) -> RxMetadata {
        RxMetadata {
            gateway_ids: GatewayIds::new(gw),
            snr,
            rssi,
            uplink_token: token.to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn test_best_link_first() {
        let mut never = md("gw-never", 20.0, -30.0, b"t");
        never.downlink_path_constraint = DownlinkPathConstraint::Never;
        let mut other = md("gw-other", 15.0, -40.0, b"t");
        other.downlink_path_constraint = DownlinkPathConstraint::PreferOther;
        let rx = vec![
            md("gw-weak", 1.0, -110.0, b"t"),
            never,
            md("gw-strong", 9.0, -80.0, b"t"),
            md("gw-no-token", 12.0, -70.0, b""),
            other,
            md("gw-strong-rssi", 9.0, -60.0, b"t"),
        ];
        let order: Vec<_> = paths_from_metadata(&rx)
            .iter()
            .map(|p| p.gateway_ids().gateway_id.clone())
            .collect();
        assert_eq!(order, vec!["gw-strong-rssi", "gw-strong", "gw-weak", "gw-other"]);
    }
}

mod util;

use std::collections::BTreeMap;

use aero_dp_mst_sim::sideband::{AckReply, NakReason, SidebandReply, SidebandRequest};
use aero_dp_mst_sim::topology::MAX_DOWNSTREAM_PORTS;
use aero_dp_mst_sim::{Guid, PeerDeviceType, Port};
use proptest::prelude::*;

use util::{send, sim_with_hpd_counter};

fn arb_peer_type() -> impl Strategy<Value = PeerDeviceType> {
    prop_oneof![
        Just(PeerDeviceType::None),
        Just(PeerDeviceType::SourceOrSst),
        Just(PeerDeviceType::MstBranch),
        Just(PeerDeviceType::SstSink),
        Just(PeerDeviceType::DpLegacyConverter),
        Just(PeerDeviceType::DpWirelessConverter),
        Just(PeerDeviceType::WirelessDpConverter),
    ]
}

fn arb_port() -> impl Strategy<Value = Port> {
    let flags = (any::<bool>(), any::<bool>(), any::<bool>());
    let streams = (0u8..=15, 0u8..=15);
    let bandwidth = (0u16..=2560).prop_flat_map(|full| (Just(full), 0..=full));
    (flags, arb_peer_type(), any::<u8>(), streams, bandwidth).prop_map(
        |((mcs, ddps, ldps), peer, dpcd_revision, (streams, sinks), (full, avail))| Port {
            message_capability: mcs,
            plug_status: ddps,
            legacy_plug_status: ldps,
            peer_device_type: peer,
            dpcd_revision,
            stream_count: streams,
            stream_sink_count: sinks,
            full_bandwidth_pbn: full,
            available_bandwidth_pbn: avail,
            ..Default::default()
        },
    )
}

fn arb_topology() -> impl Strategy<Value = Vec<Port>> {
    prop::collection::vec(arb_port(), 0..=MAX_DOWNSTREAM_PORTS).prop_map(|mut ports| {
        for (i, port) in ports.iter_mut().enumerate() {
            if port.peer_device_type == PeerDeviceType::MstBranch {
                port.peer_guid = Guid([0xA0 + i as u8; 16]);
            }
        }
        ports
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn link_address_enumerates_updated_ports(ports in arb_topology()) {
        let (sim, _hpd) = sim_with_hpd_counter();
        sim.update(&ports).unwrap();

        let SidebandReply::Ack(AckReply::LinkAddress { ports: listed, .. }) =
            send(&sim, &SidebandRequest::LinkAddress, 0)
        else {
            panic!("expected LINK_ADDRESS ack");
        };
        prop_assert_eq!(listed.len(), ports.len());
        for (i, (got, want)) in listed.iter().zip(&ports).enumerate() {
            prop_assert_eq!(got.port_number as usize, i + 1);
            prop_assert!(!got.input);
            prop_assert_eq!(got.peer_device_type, want.peer_device_type);
            prop_assert_eq!(got.message_capability, want.message_capability);
            prop_assert_eq!(got.plug_status, want.plug_status);
            prop_assert_eq!(got.legacy_plug_status, want.legacy_plug_status);
            prop_assert_eq!(got.dpcd_revision, want.dpcd_revision);
            prop_assert_eq!(got.peer_guid, want.peer_guid);
            prop_assert_eq!(got.num_sdp_streams, want.stream_count);
            prop_assert_eq!(got.num_sdp_stream_sinks, want.stream_sink_count);
        }
    }

    #[test]
    fn allocations_never_exceed_full_bandwidth(
        ops in prop::collection::vec((1u8..=4, 0u16..=600), 1..40),
    ) {
        const FULL: u16 = 1000;
        let (sim, _hpd) = sim_with_hpd_counter();
        sim.update(&[Port::sst_sink(FULL)]).unwrap();

        let mut model: BTreeMap<u8, u16> = BTreeMap::new();
        for (seq, (vcpi, pbn)) in ops.into_iter().enumerate() {
            let before = sim.port(1).unwrap().available_bandwidth_pbn;
            let request = SidebandRequest::AllocatePayload {
                port: 1,
                vcpi,
                pbn,
                sdp_stream_sinks: vec![],
            };
            let reply = send(&sim, &request, seq as u8);
            let after = sim.port(1).unwrap().available_bandwidth_pbn;
            prop_assert!(after <= FULL);

            let current = model.get(&vcpi).copied().unwrap_or(0);
            let fits = pbn <= current || pbn - current <= before;
            match reply {
                SidebandReply::Ack(AckReply::AllocatePayload { allocated_pbn, .. }) => {
                    prop_assert!(fits);
                    prop_assert_eq!(allocated_pbn, pbn);
                    if pbn == 0 {
                        model.remove(&vcpi);
                    } else {
                        model.insert(vcpi, pbn);
                    }
                }
                SidebandReply::Nak { reason, .. } => {
                    prop_assert!(!fits);
                    prop_assert_eq!(reason, NakReason::AllocateFail);
                    prop_assert_eq!(after, before);
                }
                other => panic!("unexpected reply {other:?}"),
            }
            let allocated: u16 = model.values().sum();
            prop_assert_eq!(after, FULL - allocated);
        }
    }
}

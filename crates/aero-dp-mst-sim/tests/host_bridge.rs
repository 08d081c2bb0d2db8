mod util;

use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;

use aero_dp_mst_sim::sideband::{
    encode_chunks, encode_request, join_chunks, reply_header, request_header, AckReply, NakReason,
    RequestType, SidebandReply, SidebandRequest, SIDEBAND_MAX_CHUNK_LEN,
};
use aero_dp_mst_sim::{
    status_of, HostBridge, HostCallbacks, Limits, Port, SimConfig, SimError, Simulator,
};
use pretty_assertions::assert_eq;

use util::{send, BRANCH_GUID};

#[derive(Debug, Default)]
struct Recorder {
    hpd: usize,
    requests: Vec<Vec<u8>>,
}

impl HostBridge for Recorder {
    fn notify_hpd_irq(&mut self) {
        self.hpd += 1;
    }

    fn override_reply(&mut self, request: &[u8], _reply: &mut Vec<u8>) {
        self.requests.push(request.to_vec());
    }
}

#[test]
fn shared_host_observes_hpd_and_requests() {
    let recorder = Arc::new(Mutex::new(Recorder::default()));
    let sim = Simulator::create(SimConfig::with_guid(BRANCH_GUID), recorder.clone()).unwrap();

    sim.update(&[Port::sst_sink(960)]).unwrap();
    send(&sim, &SidebandRequest::LinkAddress, 0);

    let recorder = recorder.lock().unwrap();
    assert_eq!(recorder.hpd, 1);
    assert_eq!(
        recorder.requests,
        encode_request(&SidebandRequest::LinkAddress, 0, &Limits::default())
    );
}

#[test]
fn absent_host_is_a_no_op() {
    let sim = Simulator::create(SimConfig::with_guid(BRANCH_GUID), None::<Recorder>).unwrap();
    sim.update(&[Port::sst_sink(960)]).unwrap();
    assert!(!send(&sim, &SidebandRequest::LinkAddress, 0).is_nak());
}

#[test]
fn override_replaces_the_synthesized_reply() {
    let canned = SidebandReply::Nak {
        req_type: RequestType::RemoteDpcdRead,
        guid: BRANCH_GUID,
        reason: NakReason::Defer,
        data: 0,
    };
    let header = reply_header(&request_header(RequestType::RemoteDpcdRead, 1));
    let canned_bytes =
        encode_chunks(header, &canned.encode_body(), SIDEBAND_MAX_CHUNK_LEN).concat();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let host = HostCallbacks::new(seen.clone()).on_override_reply(move |seen, request, reply| {
        seen.lock().unwrap().push(request.to_vec());
        *reply = canned_bytes.clone();
    });
    let sim = Simulator::create(SimConfig::with_guid(BRANCH_GUID), host).unwrap();
    sim.update(&[Port::sst_sink(960)]).unwrap();

    let read = SidebandRequest::RemoteDpcdRead {
        port: 1,
        address: 0,
        len: 1,
    };
    assert_eq!(send(&sim, &read, 1), canned);
    assert_eq!(
        *seen.lock().unwrap(),
        encode_request(&read, 1, &Limits::default())
    );
}

#[test]
fn override_sees_every_chunk_of_a_multi_chunk_request() {
    let recorder = Arc::new(Mutex::new(Recorder::default()));
    let sim = Simulator::create(SimConfig::with_guid(BRANCH_GUID), recorder.clone()).unwrap();
    sim.update(&[Port::sst_sink(960)]).unwrap();

    let write = SidebandRequest::RemoteDpcdWrite {
        port: 1,
        address: 0x200,
        bytes: vec![0x5A; 60],
    };
    let chunks = encode_request(&write, 0, &Limits::default());
    assert_eq!(chunks.len(), 2);
    assert_eq!(
        send(&sim, &write, 0),
        SidebandReply::Ack(AckReply::RemoteDpcdWrite { port: 1 })
    );

    let recorder = recorder.lock().unwrap();
    assert_eq!(recorder.requests, vec![chunks.concat()]);
    let (_, body) = join_chunks(&recorder.requests[0]).unwrap();
    assert_eq!(body[0], RequestType::RemoteDpcdWrite as u8);
    assert_eq!(SidebandRequest::decode_body(&body).unwrap(), write);
}

#[test]
fn callbacks_cannot_reenter_the_simulator() {
    let slot: Arc<OnceLock<Weak<Simulator>>> = Arc::new(OnceLock::new());
    let statuses = Arc::new(Mutex::new(Vec::new()));

    let host =
        HostCallbacks::new((slot.clone(), statuses.clone())).on_hpd_irq(|(slot, statuses)| {
            let sim = slot.get().and_then(Weak::upgrade).unwrap();
            let mut statuses = statuses.lock().unwrap();
            statuses.push(status_of(&sim.ports()));
            statuses.push(status_of(&sim.update(&[])));
            statuses.push(sim.is_destroyed() as i32);
        });
    let sim = Arc::new(Simulator::create(SimConfig::with_guid(BRANCH_GUID), host).unwrap());
    slot.set(Arc::downgrade(&sim)).unwrap();

    sim.update(&[Port::sst_sink(960)]).unwrap();
    assert_eq!(*statuses.lock().unwrap(), vec![-1, -1, 0]);

    // The simulator is usable again once the callback returns.
    assert_eq!(sim.ports().unwrap().len(), 2);
}

#[test]
fn reentrant_error_is_invalid_state() {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let slot: Arc<OnceLock<Weak<Simulator>>> = Arc::new(OnceLock::new());
    let host = HostCallbacks::new((slot.clone(), errors.clone())).on_override_reply(
        |(slot, errors), _, _| {
            let sim = slot.get().and_then(Weak::upgrade).unwrap();
            errors.lock().unwrap().push(sim.destroy().unwrap_err());
        },
    );
    let sim = Arc::new(Simulator::create(SimConfig::with_guid(BRANCH_GUID), host).unwrap());
    slot.set(Arc::downgrade(&sim)).unwrap();

    send(&sim, &SidebandRequest::LinkAddress, 0);
    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], SimError::InvalidState(_)));
    assert!(!sim.is_destroyed());
}

#[test]
fn concurrent_transfers_and_updates() {
    let (sim, _hpd) = util::sim_with_hpd_counter();
    let sim = Arc::new(sim);

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let sim = sim.clone();
            thread::spawn(move || {
                for seqno in 0..50u8 {
                    let SidebandReply::Ack(AckReply::LinkAddress { guid, ports }) =
                        send(&sim, &SidebandRequest::LinkAddress, seqno)
                    else {
                        panic!("expected LINK_ADDRESS ack");
                    };
                    assert_eq!(guid, BRANCH_GUID);
                    assert!(ports.len() <= 1);
                }
            })
        })
        .collect();

    let updater = {
        let sim = sim.clone();
        thread::spawn(move || {
            for i in 0..50 {
                let ports = if i % 2 == 0 {
                    vec![Port::sst_sink(960)]
                } else {
                    vec![]
                };
                sim.update(&ports).unwrap();
            }
        })
    };

    for handle in readers {
        handle.join().unwrap();
    }
    updater.join().unwrap();
    assert_eq!(sim.ports().unwrap().len(), 1);
}

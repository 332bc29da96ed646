//! End-to-end reconciliation scenarios driven through the scheduler.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use coral::commons::api::{AsNumber, ChildEntitlement, DeltaElement, RoaPayload};
use coral::daemon::scheduler::TaskKind;
use coral::test::*;

fn roa_payload(asn: u32, v4: &str) -> RoaPayload {
    RoaPayload::new(AsNumber::from_u32(asn), v4, "")
}

#[test]
fn polling_a_new_parent_class_creates_one_shadow() {
    let (mut server, mut reactor, bench) = test_server();
    let alice = bootstrap_ca(&mut server, &mut reactor, &bench, "alice");

    let ca = server.ca(&alice).unwrap();
    let parent = ca.parent(&parent_handle("ripe")).unwrap();
    assert_eq!(parent.classes().count(), 1);

    // the new signing key published its first CRL and manifest
    assert_eq!(bench.repo.exchanges(), 1);
    let delta = bench.repo.last_delta().unwrap();
    assert_eq!(delta.len(), 2);

    // polling again with an unchanged answer publishes nothing
    run_task(&mut server, &mut reactor, &alice, TaskKind::PollParents);
    assert_eq!(bench.repo.exchanges(), 1);
}

#[test]
fn an_empty_class_list_deletes_all_shadows() {
    let (mut server, mut reactor, bench) = test_server();
    let alice = bootstrap_ca(&mut server, &mut reactor, &bench, "alice");
    let key = active_key(&server, &alice);

    bench
        .parents
        .classes
        .lock()
        .unwrap()
        .insert((alice.clone(), parent_handle("ripe")), Vec::new());

    run_task(&mut server, &mut reactor, &alice, TaskKind::PollParents);

    let ca = server.ca(&alice).unwrap();
    assert!(ca.shadow_class_names(&parent_handle("ripe")).is_empty());

    // the orphaned key was withdrawn and sent for revocation at the parent
    assert!(bench.parents.revoked.lock().unwrap().contains(&key));
    let delta = bench.repo.last_delta().unwrap();
    assert!(delta
        .elements()
        .iter()
        .all(|e| matches!(e, DeltaElement::Withdraw(_))));
}

#[test]
fn roa_reconciliation_is_idempotent() {
    let (mut server, mut reactor, bench) = test_server();
    let alice = bootstrap_ca(&mut server, &mut reactor, &bench, "alice");

    bench.irdb.data.lock().unwrap().roa_requests.insert(
        alice.clone(),
        vec![roa_payload(64496, "10.0.0.0/24")],
    );

    // first pass: one ROA created and published, with a fresh CRL and
    // manifest beside it
    run_task(&mut server, &mut reactor, &alice, TaskKind::UpdateRoas);
    assert_eq!(server.ca(&alice).unwrap().roas().len(), 1);
    let delta = bench.repo.last_delta().unwrap();
    assert_eq!(delta.len(), 3);
    assert_eq!(
        delta
            .elements()
            .iter()
            .filter(|e| e.uri().to_string().ends_with(".roa"))
            .count(),
        1
    );

    // second pass with the unchanged desired set: nothing to publish
    let before = bench.repo.exchanges();
    run_task(&mut server, &mut reactor, &alice, TaskKind::UpdateRoas);
    assert_eq!(bench.repo.exchanges(), before);
    assert_eq!(server.ca(&alice).unwrap().roas().len(), 1);

    // third pass without the request: one withdraw, object deleted
    bench
        .irdb
        .data
        .lock()
        .unwrap()
        .roa_requests
        .insert(alice.clone(), Vec::new());
    run_task(&mut server, &mut reactor, &alice, TaskKind::UpdateRoas);

    assert_eq!(server.ca(&alice).unwrap().roas().len(), 0);
    let delta = bench.repo.last_delta().unwrap();
    let withdraws: Vec<_> = delta
        .elements()
        .iter()
        .filter(|e| matches!(e, DeltaElement::Withdraw(_)))
        .collect();
    assert_eq!(withdraws.len(), 1);
    assert!(withdraws[0].uri().to_string().ends_with(".roa"));
}

#[test]
fn empty_resource_intersection_revokes_instead_of_reissuing() {
    let (mut server, mut reactor, bench) = test_server();
    let alice = bootstrap_ca(&mut server, &mut reactor, &bench, "alice");

    let child = child_handle("carol");
    let child_key = key_id(901);
    give_child_a_cert(
        &mut server,
        &alice,
        &child,
        child_key,
        resources("", "10.1.0.0/16", ""),
    );

    // the desired resources no longer overlap with what was issued
    bench.irdb.data.lock().unwrap().child_resources.insert(
        (alice.clone(), child.clone()),
        ChildEntitlement {
            resources: resources("", "192.168.0.0/16", ""),
            valid_until: in_weeks(30),
        },
    );

    run_task(&mut server, &mut reactor, &alice, TaskKind::UpdateChildren);

    let ca = server.ca(&alice).unwrap();
    assert!(!ca.child_has_certs(&child));

    let delta = bench.repo.last_delta().unwrap();
    // the certificate is withdrawn, never reissued with empty resources
    assert_eq!(
        delta
            .elements()
            .iter()
            .filter(|e| matches!(e, DeltaElement::Withdraw(_)))
            .count(),
        1
    );
    assert!(!delta
        .elements()
        .iter()
        .any(|e| matches!(e, DeltaElement::Publish(p)
            if p.uri.to_string().ends_with(&format!("{child_key}.cer")))));
}

#[test]
fn failed_publication_is_retried_by_the_retry_task() {
    let (mut server, mut reactor, bench) = test_server();
    let alice = bootstrap_ca(&mut server, &mut reactor, &bench, "alice");

    bench.irdb.data.lock().unwrap().roa_requests.insert(
        alice.clone(),
        vec![roa_payload(64496, "10.0.0.0/24")],
    );

    // the publication server is down for the ROA pass; the task exits
    // anyway and the elements stay unconfirmed
    bench.repo.fail_next.store(true, Ordering::SeqCst);
    run_task(&mut server, &mut reactor, &alice, TaskKind::UpdateRoas);
    let pending = server
        .ca(&alice)
        .unwrap()
        .unconfirmed_for_active_keys()
        .len();
    assert_eq!(pending, 3);

    // the retry task re-sends everything once the server is back
    run_task(
        &mut server,
        &mut reactor,
        &alice,
        TaskKind::CheckFailedPublication,
    );
    let delta = bench.repo.last_delta().unwrap();
    assert_eq!(delta.len(), 3);
    assert!(server
        .ca(&alice)
        .unwrap()
        .unconfirmed_for_active_keys()
        .is_empty());
}

#[test]
fn run_now_reports_once_when_the_whole_cycle_finished() {
    let (mut server, mut reactor, bench) = test_server();
    let alice = bootstrap_ca(&mut server, &mut reactor, &bench, "alice");

    bench.irdb.data.lock().unwrap().roa_requests.insert(
        alice.clone(),
        vec![roa_payload(64496, "10.0.0.0/24")],
    );

    let finished = Arc::new(AtomicUsize::new(0));
    let finished_cb = finished.clone();
    server
        .run_now(
            &mut reactor,
            &alice,
            Box::new(move |_, _| {
                finished_cb.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
    reactor.run(&mut server).unwrap();

    assert_eq!(finished.load(Ordering::SeqCst), 1);
    // the cycle did real work on the way
    assert_eq!(server.ca(&alice).unwrap().roas().len(), 1);
}

#[test]
fn a_task_past_its_time_slice_postpones_and_still_exits_once() {
    let mut config = coral::daemon::config::Config::defaults();
    // a time-slice in the past makes every pacing check yield
    config.task_timeslice_seconds = -1;
    let (mut server, mut reactor, bench) = test_server_with(config);
    let alice = bootstrap_ca(&mut server, &mut reactor, &bench, "alice");

    bench.irdb.data.lock().unwrap().roa_requests.insert(
        alice.clone(),
        vec![
            roa_payload(64496, "10.0.0.0/24"),
            roa_payload(64497, "10.1.0.0/24"),
        ],
    );

    let finished = Arc::new(AtomicUsize::new(0));
    let finished_cb = finished.clone();
    let task = server.new_task(&alice, TaskKind::UpdateRoas);
    task.register_completion(Box::new(
        move |_: &mut coral::daemon::caserver::CaServer, _, _| {
            finished_cb.fetch_add(1, Ordering::SeqCst);
        },
    ));
    coral::daemon::scheduler::Scheduler::add(
        &mut server,
        &mut reactor,
        task,
    );
    reactor.run(&mut server).unwrap();

    // exactly one terminal exit despite all the postponements
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(server.ca(&alice).unwrap().roas().len(), 2);
    // each item was flushed separately before the task yielded
    assert_eq!(bench.repo.exchanges(), 3);
}

#[test]
fn ghostbusters_follow_the_desired_set() {
    let (mut server, mut reactor, bench) = test_server();
    let alice = bootstrap_ca(&mut server, &mut reactor, &bench, "alice");

    bench.irdb.data.lock().unwrap().ghostbuster_requests.insert(
        alice.clone(),
        vec![
            coral::commons::api::GhostbusterRequest {
                parent: parent_handle("ripe"),
                vcard: "BEGIN:VCARD FN:Alice END:VCARD".to_string(),
            },
            // an unknown parent is warned about and skipped
            coral::commons::api::GhostbusterRequest {
                parent: parent_handle("nowhere"),
                vcard: "BEGIN:VCARD FN:Nobody END:VCARD".to_string(),
            },
        ],
    );

    run_task(
        &mut server,
        &mut reactor,
        &alice,
        TaskKind::UpdateGhostbusters,
    );
    assert_eq!(server.ca(&alice).unwrap().ghostbusters().len(), 1);

    // dropping the request revokes the record
    bench
        .irdb
        .data
        .lock()
        .unwrap()
        .ghostbuster_requests
        .insert(alice.clone(), Vec::new());
    run_task(
        &mut server,
        &mut reactor,
        &alice,
        TaskKind::UpdateGhostbusters,
    );
    assert_eq!(server.ca(&alice).unwrap().ghostbusters().len(), 0);
}

#[test]
fn the_cron_timer_queues_a_cycle_for_every_ca() {
    let (mut server, mut reactor, bench) = test_server();
    let alice = bootstrap_ca(&mut server, &mut reactor, &bench, "alice");

    bench.irdb.data.lock().unwrap().roa_requests.insert(
        alice.clone(),
        vec![roa_payload(64496, "10.0.0.0/24")],
    );

    coral::daemon::caserver::CaServer::arm_cron(
        &mut reactor,
        chrono::Duration::zero(),
    );
    // give the cycle a moment, then stop the loop; the re-armed cron stays
    // pending
    reactor.timers().arm_in(
        chrono::Duration::seconds(1),
        |_: &mut coral::daemon::caserver::CaServer, reactor| {
            reactor.exit();
            Ok(())
        },
    );
    reactor.run(&mut server).unwrap();

    assert_eq!(server.ca(&alice).unwrap().roas().len(), 1);
}

#[test]
fn ee_certificates_issue_under_exactly_one_covering_key() {
    let (mut server, mut reactor, bench) = test_server();
    let alice = bootstrap_ca(&mut server, &mut reactor, &bench, "alice");

    let covered = coral::commons::api::EeCertRequest {
        key: key_id(950),
        subject: "router-one".to_string(),
        resources: resources("", "10.2.0.0/16", ""),
        valid_until: in_weeks(26),
    };
    let uncovered = coral::commons::api::EeCertRequest {
        key: key_id(951),
        subject: "router-two".to_string(),
        resources: resources("", "172.16.0.0/12", ""),
        valid_until: in_weeks(26),
    };
    bench
        .irdb
        .data
        .lock()
        .unwrap()
        .ee_requests
        .insert(alice.clone(), vec![covered, uncovered]);

    run_task(
        &mut server,
        &mut reactor,
        &alice,
        TaskKind::UpdateEeCertificates,
    );

    let ca = server.ca(&alice).unwrap();
    assert_eq!(ca.ee_certs().len(), 1);
    assert_eq!(*ca.ee_certs().iter().next().unwrap().key(), key_id(950));
}

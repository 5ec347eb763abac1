//! Live-socket tests for the dispatch fabric over loopback.

use std::time::Duration;

use kiln_comms::channel::Channel;
use kiln_comms::delegator::{Delegator, DelegatorSettings};
use kiln_comms::agent::{Agent, AgentSettings};
use kiln_comms::requester::Requester;
use kiln_comms::worker::{run_worker, WorkerSettings};
use kiln_proto::{wire, Message, Subject};
use tokio::sync::broadcast;
use tokio::time::timeout;
use zeromq::{DealerSocket, Socket};

fn ipc_addr(tag: &str) -> String {
    format!(
        "ipc://{}/kiln-test-{}-{}.sock",
        std::env::temp_dir().display(),
        tag,
        std::process::id()
    )
}

async fn fake_worker(network_addr: String, job_types: (u32, u32)) -> Channel<DealerSocket> {
    let mut socket = DealerSocket::new();
    socket.connect(&network_addr).await.unwrap();
    let mut channel = Channel::direct("fake-worker", socket);

    let hello = wire::Hello {
        hb_timeout_secs: 1,
        job_type_lo: job_types.0,
        job_type_hi: job_types.1,
    };
    channel
        .send(&Message::direct(Subject::Hello, hello.encode()))
        .await;

    // The delegator answers HELLO with WELCOME before anything else.
    let welcome = timeout(Duration::from_secs(5), channel.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(welcome.subject, Subject::Welcome);
    channel
}

/// Serve `n` jobs, answering each with `job_type - 1`.
async fn serve_jobs(channel: &mut Channel<DealerSocket>, n: usize) {
    let mut served = 0;
    while served < n {
        let msg = timeout(Duration::from_secs(5), channel.recv())
            .await
            .unwrap()
            .unwrap();
        match msg.subject {
            Subject::Job => {
                let job = wire::Job::decode(&msg.payload).unwrap();
                let result = wire::JobResult {
                    id: job.id,
                    data: (job.job_type - 1) as f32,
                };
                channel
                    .send(&Message::direct(Subject::Result, result.encode()))
                    .await;
                served += 1;
            }
            Subject::Heartbeat => {}
            other => panic!("unexpected {other} on worker link"),
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_roundtrip_through_delegator() {
    let settings = DelegatorSettings {
        requester_addr: ipc_addr("rt-front"),
        network_addr: "tcp://127.0.0.1:25961".to_string(),
        n_job_types: 3,
        // Generous timeout: the fake worker never sends heartbeats.
        heartbeat_timeout: Duration::from_secs(10),
        max_jobs_per_worker: 10,
    };

    let delegator = Delegator::bind(settings.clone()).await.unwrap();
    let (stop, _) = broadcast::channel(1);
    let delegator_task = tokio::spawn(delegator.run(stop.subscribe()));

    let mut worker = fake_worker(settings.network_addr.clone(), (1, 3)).await;

    let mut requester = Requester::connect(&settings.requester_addr).await.unwrap();
    requester.submit(42, &[1.0, 2.0, 3.0]).await.unwrap();

    serve_jobs(&mut worker, 3).await;

    let (id, data) = timeout(Duration::from_secs(5), requester.retrieve())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(id, 42);
    assert_eq!(data, vec![0.0, 1.0, 2.0]);

    stop.send(()).unwrap();
    delegator_task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn dead_worker_jobs_are_reassigned() {
    let settings = DelegatorSettings {
        requester_addr: ipc_addr("dead-front"),
        network_addr: "tcp://127.0.0.1:25962".to_string(),
        n_job_types: 1,
        // Short timeout so the vanished worker expires quickly.
        heartbeat_timeout: Duration::from_secs(1),
        max_jobs_per_worker: 10,
    };

    let delegator = Delegator::bind(settings.clone()).await.unwrap();
    let (stop, _) = broadcast::channel(1);
    let delegator_task = tokio::spawn(delegator.run(stop.subscribe()));

    // First worker takes the job and disappears without answering.
    let first = fake_worker(settings.network_addr.clone(), (1, 1)).await;

    let mut requester = Requester::connect(&settings.requester_addr).await.unwrap();
    requester.submit(7, &[0.5]).await.unwrap();

    let mut first = first;
    let msg = timeout(Duration::from_secs(5), first.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.subject, Subject::Job);
    drop(first);

    // Wait past two heartbeat intervals, then bring up a replacement.
    tokio::time::sleep(Duration::from_secs(3)).await;
    let mut second = fake_worker(settings.network_addr.clone(), (1, 1)).await;
    serve_jobs(&mut second, 1).await;

    let (id, data) = timeout(Duration::from_secs(5), requester.retrieve())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(id, 7);
    assert_eq!(data.len(), 1);
    assert_eq!(data[0], 0.0);

    stop.send(()).unwrap();
    delegator_task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn full_stack_with_agent_and_worker() {
    let settings = DelegatorSettings {
        requester_addr: ipc_addr("full-front"),
        network_addr: "tcp://127.0.0.1:25963".to_string(),
        n_job_types: 1,
        heartbeat_timeout: Duration::from_secs(2),
        max_jobs_per_worker: 10,
    };

    let delegator = Delegator::bind(settings.clone()).await.unwrap();
    let (stop, _) = broadcast::channel(1);
    let delegator_task = tokio::spawn(delegator.run(stop.subscribe()));

    let agent_settings = AgentSettings {
        bind_addr: ipc_addr("full-agent"),
        network_addr: settings.network_addr.clone(),
        heartbeat_timeout: Duration::from_secs(2),
    };
    let agent = Agent::connect(agent_settings.clone()).await.unwrap();
    let agent_task = tokio::spawn(agent.run(stop.subscribe()));

    let worker_settings = WorkerSettings {
        agent_addr: agent_settings.bind_addr.clone(),
        job_type_range: (1, 1),
        hb_timeout: Duration::from_secs(2),
    };
    let likelihood: kiln_comms::worker::LikelihoodFn =
        std::sync::Arc::new(|_t, x: &[f32]| x.iter().map(|v| 0.5 * f64::from(*v) * f64::from(*v)).sum());
    let worker_task = tokio::spawn(run_worker(worker_settings, likelihood, stop.subscribe()));

    let mut requester = Requester::connect(&settings.requester_addr).await.unwrap();
    requester.submit(1, &[3.0, 4.0]).await.unwrap();

    let (id, data) = timeout(Duration::from_secs(10), requester.retrieve())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(id, 1);
    assert_eq!(data.len(), 1);
    // 0.5 * (9 + 16), through an f32 narrowing.
    assert!((data[0] - 12.5).abs() < 1e-3);

    stop.send(()).unwrap();
    delegator_task.await.unwrap().unwrap();
    let _ = agent_task.await;
    let _ = worker_task.await;
}

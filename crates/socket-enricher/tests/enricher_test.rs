
use shared::{FakeProbes, Journal};
use socket_enricher::SocketEnricher;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const FAST_SWEEP: Duration = Duration::from_millis(20);

/// Test that the sweep runs on every tick
#[test_log::test]
fn test_sweep_runs_periodically() -> anyhow::Result<()> {
    let journal = Arc::new(Journal::default());
    let enricher = SocketEnricher::start(FakeProbes::new(journal.clone()), FAST_SWEEP)?;

    thread::sleep(FAST_SWEEP * 10);
    assert!(
        journal.sweeps() >= 2,
        "Expected at least 2 sweeps, got {}",
        journal.sweeps()
    );

    enricher.close();
    Ok(())
}

/// Test that failing sweeps are only logged and keep the schedule going
#[test_log::test]
fn test_sweep_errors_do_not_stop_the_schedule() -> anyhow::Result<()> {
    let journal = Arc::new(Journal::default());
    let probes = FakeProbes {
        failing_sweeps: true,
        ..FakeProbes::new(journal.clone())
    };
    let enricher = SocketEnricher::start(probes, FAST_SWEEP)?;

    thread::sleep(FAST_SWEEP * 10);
    assert!(
        journal.sweeps() >= 2,
        "Expected the sweep to keep running after errors, got {} sweeps",
        journal.sweeps()
    );
    assert!(!enricher.is_closed());

    enricher.close();
    Ok(())
}

/// Test that no sweep happens once close returned
#[test_log::test]
fn test_close_stops_the_sweep() -> anyhow::Result<()> {
    let journal = Arc::new(Journal::default());
    let enricher = SocketEnricher::start(FakeProbes::new(journal.clone()), FAST_SWEEP)?;

    thread::sleep(FAST_SWEEP * 3);
    enricher.close();
    let sweeps = journal.sweeps();

    thread::sleep(FAST_SWEEP * 5);
    assert_eq!(journal.sweeps(), sweeps);
    assert!(enricher.is_closed());
    Ok(())
}

/// Test that links are released in attach order, then the object
#[test_log::test]
fn test_close_releases_links_in_order() -> anyhow::Result<()> {
    let journal = Arc::new(Journal::default());
    let enricher = SocketEnricher::start(FakeProbes::new(journal.clone()), FAST_SWEEP)?;

    enricher.close();

    assert_eq!(
        journal.released(),
        vec![
            "link:inet_bind",
            "link:inet6_bind",
            "link:ig_sk_cleanup",
            "object"
        ]
    );
    Ok(())
}

/// Test that concurrent and repeated closes shut down and release exactly once
#[test_log::test]
fn test_concurrent_close_releases_once() -> anyhow::Result<()> {
    let journal = Arc::new(Journal::default());
    let enricher = Arc::new(SocketEnricher::start(
        FakeProbes::new(journal.clone()),
        FAST_SWEEP,
    )?);

    let closers: Vec<_> = (0..2)
        .map(|_| {
            let enricher = enricher.clone();
            thread::spawn(move || enricher.close())
        })
        .collect();
    for closer in closers {
        closer.join().unwrap();
    }
    enricher.close();
    drop(enricher);

    assert_eq!(journal.releases(), 1);
    assert_eq!(journal.released().len(), 4);
    Ok(())
}

/// Test that dropping an enricher closes it
#[test_log::test]
fn test_drop_closes() -> anyhow::Result<()> {
    let journal = Arc::new(Journal::default());
    let enricher = SocketEnricher::start(FakeProbes::new(journal.clone()), FAST_SWEEP)?;

    drop(enricher);

    assert_eq!(journal.releases(), 1);
    Ok(())
}

/// Test that the probes are released when the sweep cannot be prepared
#[test_log::test]
fn test_start_failure_releases_probes() {
    let journal = Arc::new(Journal::default());
    let probes = FakeProbes {
        broken_sweeper: true,
        ..FakeProbes::new(journal.clone())
    };

    let result = SocketEnricher::start(probes, FAST_SWEEP);

    assert!(result.is_err());
    assert_eq!(journal.releases(), 1);
}

/// Test that the sockets map stays usable while the enricher runs
#[test_log::test]
fn test_sockets_map_is_exposed() -> anyhow::Result<()> {
    let journal = Arc::new(Journal::default());
    let enricher = SocketEnricher::start(FakeProbes::new(journal), FAST_SWEEP)?;

    let map = enricher.sockets_map()?.expect("enricher is running");
    assert!(fd_is_open(map.as_raw_fd()));

    enricher.close();
    Ok(())
}

/// Test that closing releases the sockets map along with the programs
#[test_log::test]
fn test_close_releases_the_sockets_map() -> anyhow::Result<()> {
    let journal = Arc::new(Journal::default());
    let enricher = SocketEnricher::start(FakeProbes::new(journal.clone()), FAST_SWEEP)?;
    drop(enricher.sockets_map()?);
    assert!(!journal.sockets_map_closed());

    enricher.close();

    assert!(journal.sockets_map_closed());
    assert!(enricher.sockets_map()?.is_none());
    Ok(())
}

fn fd_is_open(fd: i32) -> bool {
    std::fs::metadata(format!("/proc/self/fd/{fd}")).is_ok()
}

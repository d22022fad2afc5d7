use anyhow::{Context, Result};
use nettracer_bpf::{ProbeSet, attach_kprobe, attach_kprobe_kretprobe};

use crate::SOCKETS_MAP_NAME;

/// Iterator seeding the map with the sockets that exist at start
pub const SEED_ITERATOR: &str = "ig_sockets_it";
/// Map iterator evicting entries of destroyed sockets
pub const CLEANUP_ITERATOR: &str = "ig_sk_cleanup";

/// Attach steps of the socket enricher programs, available on every [`ProbeSet`]
pub trait SocketProbes: ProbeSet {
    // bind
    attach_kprobe_kretprobe!(inet_bind, ig_bind_ipv4_e, ig_bind_ipv4_x);
    attach_kprobe_kretprobe!(inet6_bind, ig_bind_ipv6_e, ig_bind_ipv6_x);

    // connect
    attach_kprobe_kretprobe!(tcp_v4_connect, ig_tcpc_v4_co_e, ig_tcpc_v4_co_x);
    attach_kprobe_kretprobe!(tcp_v6_connect, ig_tcpc_v6_co_e, ig_tcpc_v6_co_x);

    // send
    attach_kprobe!(udp_sendmsg, ig_udp_sendmsg);
    attach_kprobe!(udpv6_sendmsg, ig_udp6_sendmsg);

    // release
    attach_kprobe!(inet_release, ig_free_ipv4_e);
    attach_kprobe!(inet6_release, ig_free_ipv6_e);
}

impl<T: ProbeSet + ?Sized> SocketProbes for T {}

/// Attach every socket enricher program in a fixed order.
///
/// Stops at the first failure. The links attached so far stay owned by `probes`, the caller is
/// responsible for releasing them.
pub fn attach_socket_probes<P: ProbeSet + ?Sized>(probes: &mut P) -> Result<()> {
    probes.attach_inet_bind()?;
    probes.attach_inet6_bind()?;

    probes.attach_tcp_v4_connect()?;
    probes.attach_tcp_v6_connect()?;

    probes.attach_udp_sendmsg()?;
    probes.attach_udpv6_sendmsg()?;

    probes.attach_inet_release()?;
    probes.attach_inet6_release()?;

    // Get the sockets that were opened before the probes were in place
    probes
        .run_iterator(SEED_ITERATOR)
        .context("Failed to seed the sockets map")?;

    probes
        .attach_map_iterator(CLEANUP_ITERATOR, SOCKETS_MAP_NAME)
        .context("Failed to attach the sockets cleanup iterator")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        steps: Vec<String>,
        fail_at: Option<String>,
    }

    impl Recorder {
        fn step(&mut self, step: String) -> Result<()> {
            if self.fail_at.as_deref() == Some(step.as_str()) {
                anyhow::bail!("injected failure");
            }
            self.steps.push(step);
            Ok(())
        }
    }

    impl ProbeSet for Recorder {
        fn attach_kprobe(&mut self, program: &str, function: &str, retprobe: bool) -> Result<()> {
            let kind = if retprobe { "kretprobe" } else { "kprobe" };
            self.step(format!("{kind}:{function}:{program}"))
        }

        fn run_iterator(&mut self, program: &str) -> Result<()> {
            self.step(format!("run:{program}"))
        }

        fn attach_map_iterator(&mut self, program: &str, map: &str) -> Result<()> {
            self.step(format!("iter:{program}:{map}"))
        }
    }

    #[test_log::test]
    fn test_attach_order() {
        let mut recorder = Recorder::default();
        attach_socket_probes(&mut recorder).unwrap();

        assert_eq!(
            recorder.steps,
            vec![
                "kprobe:inet_bind:ig_bind_ipv4_e",
                "kretprobe:inet_bind:ig_bind_ipv4_x",
                "kprobe:inet6_bind:ig_bind_ipv6_e",
                "kretprobe:inet6_bind:ig_bind_ipv6_x",
                "kprobe:tcp_v4_connect:ig_tcpc_v4_co_e",
                "kretprobe:tcp_v4_connect:ig_tcpc_v4_co_x",
                "kprobe:tcp_v6_connect:ig_tcpc_v6_co_e",
                "kretprobe:tcp_v6_connect:ig_tcpc_v6_co_x",
                "kprobe:udp_sendmsg:ig_udp_sendmsg",
                "kprobe:udpv6_sendmsg:ig_udp6_sendmsg",
                "kprobe:inet_release:ig_free_ipv4_e",
                "kprobe:inet6_release:ig_free_ipv6_e",
                "run:ig_sockets_it",
                "iter:ig_sk_cleanup:sockets",
            ]
        );
    }

    #[test_log::test]
    fn test_first_failure_aborts_the_sequence() {
        let mut recorder = Recorder {
            fail_at: Some("kretprobe:tcp_v4_connect:ig_tcpc_v4_co_x".into()),
            ..Default::default()
        };

        let err = attach_socket_probes(&mut recorder).unwrap_err();

        assert_eq!(err.to_string(), "Failed to attach tcp_v4_connect kretprobe");
        assert_eq!(recorder.steps.len(), 5);
        assert_eq!(
            recorder.steps.last().map(String::as_str),
            Some("kprobe:tcp_v4_connect:ig_tcpc_v4_co_e")
        );
    }

    #[test_log::test]
    fn test_seed_failure_skips_cleanup_iterator() {
        let mut recorder = Recorder {
            fail_at: Some(format!("run:{SEED_ITERATOR}")),
            ..Default::default()
        };

        let err = attach_socket_probes(&mut recorder).unwrap_err();

        assert_eq!(err.to_string(), "Failed to seed the sockets map");
        assert!(!recorder.steps.iter().any(|s| s.starts_with("iter:")));
    }
}

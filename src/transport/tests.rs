//! Transport Module Tests
//!
//! ## Test Scopes
//! - **Local Network**: Unicast routing, broadcast loopback, source stamping and detaching.
//! - **UDP**: Datagram exchange between two stacks on the loopback interface.

#[cfg(test)]
mod tests {
    use crate::config::TransportConfig;
    use crate::stack::testing::{drain, wait_for_event};
    use crate::stack::{Address, Event, Message, Protocol, ProtocolStack, TimeScheduler, View};
    use crate::transport::{LocalNetwork, LocalTransport, UdpTransport};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    const WAIT: Duration = Duration::from_secs(5);

    fn local_member(
        network: &Arc<LocalNetwork>,
        name: &str,
    ) -> (ProtocolStack, UnboundedReceiver<Event>) {
        let transport = LocalTransport::new(network.clone());
        let (stack, events) =
            ProtocolStack::new(vec![transport as Arc<dyn Protocol>], TimeScheduler::new())
                .expect("Failed to build stack");
        stack.set_local_address(Address::from(name));
        (stack, events)
    }

    fn payload_msg(dest: Option<&str>, payload: &[u8]) -> Message {
        let mut msg = match dest {
            Some(dest) => Message::unicast(Address::from(dest)),
            None => Message::broadcast(),
        };
        msg.payload = payload.to_vec();
        msg
    }

    fn is_msg(evt: &Event) -> bool {
        matches!(evt, Event::Msg(_))
    }

    // ============================================================
    // LOCAL NETWORK TESTS
    // ============================================================

    #[tokio::test]
    async fn test_unicast_reaches_only_destination() {
        // ARRANGE
        let network = LocalNetwork::new();
        let (stack_a, mut events_a) = local_member(&network, "A");
        let (_stack_b, mut events_b) = local_member(&network, "B");
        let (_stack_c, mut events_c) = local_member(&network, "C");

        // ACT
        stack_a.down(Event::Msg(payload_msg(Some("B"), b"hi")));

        // ASSERT: B gets it with the sender stamped, nobody else does
        let evt = wait_for_event(&mut events_b, WAIT, is_msg).await;
        match evt {
            Some(Event::Msg(msg)) => {
                assert_eq!(msg.src, Some(Address::from("A")));
                assert_eq!(msg.payload, b"hi".to_vec());
            }
            other => panic!("Unexpected event: {:?}", other),
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(drain(&mut events_a).is_empty());
        assert!(drain(&mut events_c).is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_is_looped_back() {
        let network = LocalNetwork::new();
        let (stack_a, mut events_a) = local_member(&network, "A");
        let (_stack_b, mut events_b) = local_member(&network, "B");

        stack_a.down(Event::Msg(payload_msg(None, b"all")));

        assert!(wait_for_event(&mut events_a, WAIT, is_msg).await.is_some());
        assert!(wait_for_event(&mut events_b, WAIT, is_msg).await.is_some());
    }

    #[tokio::test]
    async fn test_detached_member_is_unreachable() {
        // ARRANGE
        let network = LocalNetwork::new();
        let (stack_a, _events_a) = local_member(&network, "A");
        let (stack_b, mut events_b) = local_member(&network, "B");
        assert_eq!(network.members(), vec![Address::from("A"), Address::from("B")]);

        // ACT
        stack_b.stop();
        stack_a.down(Event::Msg(payload_msg(Some("B"), b"lost")));

        // ASSERT
        assert_eq!(network.members(), vec![Address::from("A")]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(drain(&mut events_b).is_empty());
    }

    #[tokio::test]
    async fn test_control_events_stop_at_transport() {
        let network = LocalNetwork::new();
        let (stack_a, mut events_a) = local_member(&network, "A");

        stack_a.connect("group");
        stack_a.install_view(View::new(vec![Address::from("A")]));
        stack_a.down(Event::Suspect(Address::from("B")));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(drain(&mut events_a).is_empty());
    }

    // ============================================================
    // UDP TESTS
    // ============================================================

    fn udp_member() -> (Arc<UdpTransport>, ProtocolStack, UnboundedReceiver<Event>) {
        let transport = UdpTransport::new(&TransportConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            initial_hosts: Vec::new(),
        });
        let (stack, events) =
            ProtocolStack::new(vec![transport.clone() as Arc<dyn Protocol>], TimeScheduler::new())
                .expect("Failed to build stack");

        stack.set_local_address(transport.address());
        stack.connect("udp-test");
        (transport, stack, events)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_udp_unicast_and_broadcast() {
        // ARRANGE: Two endpoints that know each other through the view
        let (t1, stack1, mut events1) = udp_member();
        let (t2, stack2, mut events2) = udp_member();
        assert_ne!(t1.endpoint().port(), 0);
        let view = View::new(vec![t1.address(), t2.address()]);
        stack1.install_view(view.clone());
        stack2.install_view(view);

        // ACT: Unicast 1 -> 2
        let mut msg = Message::unicast(t2.address());
        msg.payload = b"ping".to_vec();
        stack1.down(Event::Msg(msg));

        // ASSERT
        match wait_for_event(&mut events2, WAIT, is_msg).await {
            Some(Event::Msg(msg)) => {
                assert_eq!(msg.src, Some(t1.address()));
                assert_eq!(msg.payload, b"ping".to_vec());
            }
            other => panic!("Unexpected event: {:?}", other),
        }

        // ACT: Broadcast from 2 reaches both
        stack2.down(Event::Msg(Message::broadcast()));

        // ASSERT
        assert!(wait_for_event(&mut events1, WAIT, is_msg).await.is_some());
        assert!(wait_for_event(&mut events2, WAIT, is_msg).await.is_some());
        assert!(t2.known_peers().contains(&t1.endpoint()));

        stack1.stop();
        stack2.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_udp_view_prunes_unknown_senders() {
        // ARRANGE: 3 is not part of 1's view but talks to it anyway
        let (t1, stack1, mut events1) = udp_member();
        let (t2, _stack2, _events2) = udp_member();
        let (t3, stack3, _events3) = udp_member();
        stack1.install_view(View::new(vec![t1.address(), t2.address()]));

        stack3.down(Event::Msg(Message::unicast(t1.address())));
        assert!(wait_for_event(&mut events1, WAIT, is_msg).await.is_some());
        assert!(t1.known_peers().contains(&t3.endpoint()));

        // ACT
        stack1.install_view(View::new(vec![t1.address(), t2.address()]));

        // ASSERT
        let mut expected = vec![t1.endpoint(), t2.endpoint()];
        expected.sort();
        assert_eq!(t1.known_peers(), expected);
    }

    #[tokio::test]
    async fn test_udp_bind_failure_aborts_stack() {
        let (t1, _stack1, _events1) = udp_member();

        let clash = UdpTransport::new(&TransportConfig {
            bind: t1.endpoint(),
            initial_hosts: Vec::new(),
        });
        let result = ProtocolStack::new(vec![clash as Arc<dyn Protocol>], TimeScheduler::new());

        assert!(result.is_err());
    }
}

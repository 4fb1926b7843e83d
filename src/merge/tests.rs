//! Merge Module Tests
//!
//! ## Test Scopes
//! - **Coordinator Status**: Announcer started and stopped as views change.
//! - **Announcement Handling**: MERGE emitted once per detected pair, then the set resets.
//! - **Partition Scenario**: Two self-elected coordinators on a shared network.

#[cfg(test)]
mod tests {
    use crate::config::MergeConfig;
    use crate::merge::MergeDetector;
    use crate::merge::types::{CoordAnnouncement, NAME};
    use crate::stack::testing::{Recorder, drain, wait_for_event, wait_until};
    use crate::stack::{Address, Event, Message, Protocol, ProtocolStack, TimeScheduler, View};
    use crate::transport::{LocalNetwork, LocalTransport};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    const WAIT: Duration = Duration::from_secs(5);

    fn addr(name: &str) -> Address {
        Address::from(name)
    }

    fn view(names: &[&str]) -> View {
        View::new(names.iter().map(|name| addr(name)))
    }

    fn fast_config() -> MergeConfig {
        MergeConfig {
            min_interval_ms: 20,
            max_interval_ms: 40,
            use_separate_thread: false,
        }
    }

    fn setup(
        config: MergeConfig,
    ) -> (Arc<MergeDetector>, Arc<Recorder>, ProtocolStack, UnboundedReceiver<Event>) {
        let timer = TimeScheduler::new();
        let detector = MergeDetector::new(config, timer.clone());
        let recorder = Recorder::new("WIRE");
        let (stack, events) = ProtocolStack::new(
            vec![detector.clone() as Arc<dyn Protocol>, recorder.clone() as Arc<dyn Protocol>],
            timer,
        )
        .expect("Failed to build stack");

        stack.set_local_address(addr("A"));
        recorder.clear();

        (detector, recorder, stack, events)
    }

    fn announcement(from: &str) -> Event {
        let mut msg = Message::broadcast()
            .with_header(
                NAME,
                &CoordAnnouncement {
                    coord_addr: addr(from),
                },
            )
            .expect("Failed to encode header");
        msg.src = Some(addr(from));
        Event::Msg(msg)
    }

    fn sent_announcements(recorder: &Recorder) -> Vec<Address> {
        recorder
            .down_messages()
            .into_iter()
            .filter_map(|mut msg| {
                let hdr = msg.remove_header::<CoordAnnouncement>(NAME)?.ok()?;
                Some(hdr.coord_addr)
            })
            .collect()
    }

    fn merges(events: Vec<Event>) -> Vec<Vec<Address>> {
        events
            .into_iter()
            .filter_map(|evt| match evt {
                Event::Merge(coords) => Some(coords),
                _ => None,
            })
            .collect()
    }

    // ============================================================
    // COORDINATOR STATUS TESTS
    // ============================================================

    #[tokio::test]
    async fn test_coordinator_seeds_set_and_announces() {
        // ARRANGE
        let (detector, recorder, stack, _events) = setup(fast_config());

        // ACT
        stack.install_view(view(&["A", "B"]));

        // ASSERT: View forwarded, set seeded, announcements broadcast
        assert_eq!(recorder.down_events()[0], Event::ViewChange(view(&["A", "B"])));
        assert!(detector.is_coordinator());
        assert_eq!(detector.announcements(), vec![addr("A")]);
        assert!(wait_until(WAIT, || sent_announcements(&recorder).len() >= 2).await);
        assert!(sent_announcements(&recorder).iter().all(|coord| *coord == addr("A")));
        assert!(recorder.down_messages().iter().all(|msg| msg.is_broadcast()));
    }

    #[tokio::test]
    async fn test_non_coordinator_does_not_announce() {
        let (detector, recorder, stack, _events) = setup(fast_config());

        stack.install_view(view(&["B", "A"]));
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(!detector.is_coordinator());
        assert!(sent_announcements(&recorder).is_empty());
        assert_eq!(stack.timer().active_tasks(), 0);
    }

    #[tokio::test]
    async fn test_losing_coordinator_role_stops_announcer() {
        // ARRANGE
        let (detector, recorder, stack, _events) = setup(fast_config());
        stack.install_view(view(&["A"]));
        assert!(wait_until(WAIT, || !sent_announcements(&recorder).is_empty()).await);

        // ACT: Someone else takes over
        stack.install_view(view(&["B", "A"]));

        // ASSERT
        assert!(!detector.is_coordinator());
        assert!(detector.announcements().is_empty());
        assert!(wait_until(WAIT, || stack.timer().active_tasks() == 0).await);
        let sent = sent_announcements(&recorder).len();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(sent_announcements(&recorder).len(), sent);
    }

    // ============================================================
    // ANNOUNCEMENT HANDLING TESTS
    // ============================================================

    #[tokio::test]
    async fn test_second_coordinator_triggers_single_merge() {
        // ARRANGE
        let (detector, recorder, stack, mut events) = setup(fast_config());
        stack.install_view(view(&["A", "C"]));

        // ACT
        recorder.inject_up(announcement("B"));

        // ASSERT: One MERGE with both coordinators, set back to the local one
        assert_eq!(merges(drain(&mut events)), vec![vec![addr("A"), addr("B")]]);
        assert_eq!(detector.announcements(), vec![addr("A")]);

        // A repeated announcement starts a new cycle
        recorder.inject_up(announcement("B"));
        assert_eq!(merges(drain(&mut events)), vec![vec![addr("A"), addr("B")]]);
    }

    #[tokio::test]
    async fn test_own_announcement_does_not_trigger_merge() {
        let (detector, recorder, stack, mut events) = setup(fast_config());
        stack.install_view(view(&["A"]));

        recorder.inject_up(announcement("A"));

        assert!(merges(drain(&mut events)).is_empty());
        assert_eq!(detector.announcements(), vec![addr("A")]);
    }

    #[tokio::test]
    async fn test_non_coordinator_ignores_announcements() {
        let (detector, recorder, stack, mut events) = setup(fast_config());
        stack.install_view(view(&["B", "A"]));

        recorder.inject_up(announcement("C"));
        recorder.inject_up(announcement("D"));

        assert!(merges(drain(&mut events)).is_empty());
        assert!(detector.announcements().is_empty());
    }

    #[tokio::test]
    async fn test_merge_delivered_on_separate_task() {
        let config = MergeConfig {
            use_separate_thread: true,
            ..fast_config()
        };
        let (_detector, recorder, stack, mut events) = setup(config);
        stack.install_view(view(&["A"]));

        recorder.inject_up(announcement("B"));

        let evt = wait_for_event(&mut events, WAIT, |evt| matches!(evt, Event::Merge(_))).await;
        assert_eq!(evt, Some(Event::Merge(vec![addr("A"), addr("B")])));
    }

    #[tokio::test]
    async fn test_malformed_announcement_is_dropped() {
        let (detector, recorder, stack, mut events) = setup(fast_config());
        stack.install_view(view(&["A"]));

        let mut msg = Message::broadcast();
        msg.put_header(NAME, &1u8).expect("Failed to encode header");
        recorder.inject_up(Event::Msg(msg));

        assert!(drain(&mut events).is_empty());
        assert_eq!(detector.announcements(), vec![addr("A")]);
    }

    // ============================================================
    // PARTITION SCENARIO TESTS
    // ============================================================

    fn spawn_member(
        network: &Arc<LocalNetwork>,
        name: &str,
    ) -> (ProtocolStack, UnboundedReceiver<Event>) {
        let timer = TimeScheduler::new();
        let detector = MergeDetector::new(fast_config(), timer.clone());
        let transport = LocalTransport::new(network.clone());
        let (stack, events) = ProtocolStack::new(
            vec![detector as Arc<dyn Protocol>, transport as Arc<dyn Protocol>],
            timer,
        )
        .expect("Failed to build stack");

        stack.set_local_address(addr(name));
        stack.connect("merge-test");
        (stack, events)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_healed_partition_reports_both_coordinators() {
        // ARRANGE: D and E each elected themselves after a split
        let network = LocalNetwork::new();
        let (stack_d, mut events_d) = spawn_member(&network, "D");
        let (stack_e, mut events_e) = spawn_member(&network, "E");

        // ACT
        stack_d.install_view(view(&["D"]));
        stack_e.install_view(view(&["E"]));

        // ASSERT: Whoever hears both first reports {D, E}
        let deadline = tokio::time::Instant::now() + WAIT;
        let merge = loop {
            let mut found = merges(drain(&mut events_d));
            found.extend(merges(drain(&mut events_e)));
            if let Some(coords) = found.into_iter().next() {
                break Some(coords);
            }
            if tokio::time::Instant::now() >= deadline {
                break None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };

        assert_eq!(merge, Some(vec![addr("D"), addr("E")]));

        stack_d.stop();
        stack_e.stop();
    }
}

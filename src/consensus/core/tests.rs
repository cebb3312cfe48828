use crate::consensus::{InMemoryLog, LogEntry, NodeCore, NodeState};

const NODE_ID: u64 = 0;

fn entry(term: u64, command: &str) -> LogEntry {
    LogEntry::new(term, command.to_string())
}

/// Core with log terms seeded directly, e.g. `[1, 1, 2]`.
fn core_with_log_terms(terms: &[u64]) -> NodeCore {
    let entries: Vec<LogEntry> =
        terms.iter().enumerate().map(|(i, t)| entry(*t, &format!("cmd-{}", i + 1))).collect();
    NodeCore::with_log(NODE_ID, Box::new(InMemoryLog::from_entries(entries)))
}

#[test]
fn test_core_transition_to_candidate_and_vote_for_self() {
    const TERM: u64 = 1;
    let mut core = NodeCore::new(NODE_ID);

    // check default values
    assert_eq!(core.state(), NodeState::Follower);
    assert_eq!(core.current_term(), 0);
    assert_eq!(core.voted_for(), None);

    core.transition_to_candidate();

    assert_eq!(core.state(), NodeState::Candidate);
    assert_eq!(core.current_term(), TERM);
    assert_eq!(core.voted_for(), Some(NODE_ID));
    assert_eq!(core.votes_received(), 1);
}

#[test]
fn test_core_transition_to_candidate_retry_advances_term() {
    let mut core = NodeCore::new(NODE_ID);

    core.transition_to_candidate(); // term 1
    core.transition_to_candidate(); // election retry, term 2

    assert_eq!(core.state(), NodeState::Candidate);
    assert_eq!(core.current_term(), 2);
    assert_eq!(core.voted_for(), Some(NODE_ID));
    assert_eq!(core.votes_received(), 1);
}

#[test]
fn test_core_transition_to_candidate_does_not_transition_if_leader() {
    let mut core = NodeCore::new(NODE_ID);

    core.transition_to_candidate();
    core.transition_to_leader(&[NODE_ID, 1, 2]);

    core.transition_to_candidate();

    assert_eq!(core.state(), NodeState::Leader);
    assert_eq!(core.current_term(), 1);
}

#[test]
fn test_core_transition_to_follower_resets_vote_and_leader_state() {
    const TERM_2: u64 = 2;
    let mut core = NodeCore::new(NODE_ID);

    core.transition_to_candidate(); // term 1, votes for self
    core.transition_to_leader(&[NODE_ID, 1, 2]);
    assert_eq!(core.next_index_for(1), Some(1));

    core.transition_to_follower(TERM_2);

    assert_eq!(core.state(), NodeState::Follower);
    assert_eq!(core.current_term(), TERM_2);
    assert_eq!(core.voted_for(), None);
    assert_eq!(core.votes_received(), 0);
    // replication progress is discarded on stepping down
    assert_eq!(core.next_index_for(1), None);
    assert_eq!(core.match_index_for(1), None);
}

#[test]
fn test_core_transition_to_follower_does_not_reset_for_same_term() {
    let mut core = NodeCore::new(NODE_ID);

    core.transition_to_follower(0);

    assert_eq!(core.state(), NodeState::Follower);
    assert_eq!(core.current_term(), 0);
    assert_eq!(core.voted_for(), None);
}

#[test]
fn test_core_transition_to_leader_initializes_peer_progress() {
    let mut core = core_with_log_terms(&[1, 1]);

    core.transition_to_candidate(); // term 1
    core.transition_to_leader(&[NODE_ID, 1, 2]);

    assert_eq!(core.state(), NodeState::Leader);
    // next_index points just past the leader's log, match_index starts at 0
    assert_eq!(core.next_index_for(1), Some(3));
    assert_eq!(core.next_index_for(2), Some(3));
    assert_eq!(core.match_index_for(1), Some(0));
    // the leader itself gets no entry
    assert_eq!(core.next_index_for(NODE_ID), None);
}

#[test]
fn test_core_transition_to_leader_does_not_transition_if_not_candidate() {
    let mut core = NodeCore::new(NODE_ID);

    core.transition_to_leader(&[NODE_ID, 1, 2]);

    assert_eq!(core.state(), NodeState::Follower);
    assert_eq!(core.current_term(), 0);
}

#[test]
fn test_core_record_vote_from_same_peer_counts_once() {
    let mut core = NodeCore::new(NODE_ID);
    core.transition_to_candidate();

    assert_eq!(core.record_vote_from(1), 2);
    // a re-delivered response must not inch the tally toward majority
    assert_eq!(core.record_vote_from(1), 2);
    assert_eq!(core.record_vote_from(2), 3);
}

#[test]
fn test_core_record_vote_ignored_when_not_candidate() {
    let mut core = NodeCore::new(NODE_ID);

    assert_eq!(core.record_vote_from(1), 0);
    assert_eq!(core.state(), NodeState::Follower);
}

#[test]
fn test_core_decide_vote_grants_first_vote() {
    const CANDIDATE_ID: u64 = 1;
    const CANDIDATE_TERM: u64 = 1;
    let mut core = NodeCore::new(NODE_ID);

    let (granted, term) = core.decide_vote(CANDIDATE_ID, CANDIDATE_TERM, 0, 0);

    assert!(granted);
    assert_eq!(term, CANDIDATE_TERM);
    assert_eq!(core.voted_for(), Some(CANDIDATE_ID));
    assert_eq!(core.current_term(), CANDIDATE_TERM);
}

#[test]
fn test_core_decide_vote_rejects_stale_term() {
    let mut core = NodeCore::new(NODE_ID);
    core.transition_to_follower(3);

    let (granted, term) = core.decide_vote(1, 2, 10, 2);

    assert!(!granted);
    assert_eq!(term, 3);
    assert_eq!(core.voted_for(), None);
}

#[test]
fn test_core_decide_vote_one_vote_per_term() {
    const FIRST_CANDIDATE: u64 = 1;
    const SECOND_CANDIDATE: u64 = 2;
    let mut core = NodeCore::new(NODE_ID);

    let (granted, _) = core.decide_vote(FIRST_CANDIDATE, 1, 0, 0);
    assert!(granted);

    // same term, different candidate: rejected
    let (granted, _) = core.decide_vote(SECOND_CANDIDATE, 1, 0, 0);
    assert!(!granted);
    assert_eq!(core.voted_for(), Some(FIRST_CANDIDATE));

    // same term, same candidate again: granted (idempotent)
    let (granted, _) = core.decide_vote(FIRST_CANDIDATE, 1, 0, 0);
    assert!(granted);
}

#[test]
fn test_core_decide_vote_higher_term_steps_candidate_down() {
    let mut core = NodeCore::new(NODE_ID);
    core.transition_to_candidate(); // term 1, voted for self

    let (granted, term) = core.decide_vote(1, 2, 0, 0);

    assert!(granted);
    assert_eq!(term, 2);
    assert_eq!(core.state(), NodeState::Follower);
    assert_eq!(core.voted_for(), Some(1));
}

#[test]
fn test_core_decide_vote_rejects_candidate_with_lower_last_term() {
    // Voter's last entry is term 3; candidate ends at term 2 with a longer
    // log. Term comparison wins regardless of index.
    let mut core = core_with_log_terms(&[1, 3]);
    core.transition_to_follower(3);

    let (granted, _) = core.decide_vote(1, 4, 5, 2);

    assert!(!granted);
    assert_eq!(core.voted_for(), None);
}

#[test]
fn test_core_decide_vote_compares_index_on_equal_last_term() {
    // both logs end at term 1, voter has 2 entries
    let mut shorter = core_with_log_terms(&[1, 1]);
    let (granted, _) = shorter.decide_vote(1, 2, 1, 1);
    assert!(!granted);

    let mut equal = core_with_log_terms(&[1, 1]);
    let (granted, _) = equal.decide_vote(1, 2, 2, 1);
    assert!(granted);

    let mut longer = core_with_log_terms(&[1, 1]);
    let (granted, _) = longer.decide_vote(1, 2, 3, 1);
    assert!(granted);
}

#[test]
fn test_core_follower_append_entries_appends_to_empty_log() {
    let mut core = NodeCore::new(NODE_ID);

    let (consistent, modified) =
        core.follower_append_entries(0, 0, &[entry(1, "a"), entry(1, "b")]);

    assert!(consistent);
    assert!(modified);
    assert_eq!(core.log_last_index(), 2);
    assert_eq!(core.log_last_term(), 1);
}

#[test]
fn test_core_follower_append_entries_rejects_missing_prev_entry() {
    // Follower log is [t1, t1, t2]; the leader believes index 3 holds term 1.
    // The index-3 entry has term 2, so the check fails and nothing changes.
    let mut core = core_with_log_terms(&[1, 1, 2]);

    let (consistent, modified) = core.follower_append_entries(3, 1, &[entry(3, "x")]);

    assert!(!consistent);
    assert!(!modified);
    assert_eq!(core.log_last_index(), 3);
    assert_eq!(core.log_last_term(), 2);

    // beyond the end of the log fails the same way
    let (consistent, _) = core.follower_append_entries(4, 2, &[entry(3, "x")]);
    assert!(!consistent);
}

#[test]
fn test_core_follower_append_entries_truncates_conflicting_suffix() {
    let mut core = core_with_log_terms(&[1, 1, 2]);

    // prev (2, t1) matches; the incoming t3 entry conflicts with the t2 one
    let (consistent, modified) = core.follower_append_entries(2, 1, &[entry(3, "new")]);

    assert!(consistent);
    assert!(modified);
    assert_eq!(core.log_last_index(), 3);
    assert_eq!(core.log_entry(3), Some(&entry(3, "new")));
    // the shared prefix survives
    assert_eq!(core.log_entry(2).map(|e| e.term), Some(1));
}

#[test]
fn test_core_follower_append_entries_is_idempotent() {
    let mut core = NodeCore::new(NODE_ID);
    let entries = [entry(1, "a"), entry(1, "b")];

    let (_, modified) = core.follower_append_entries(0, 0, &entries);
    assert!(modified);
    let log_after_first: Vec<LogEntry> = core.log_entries().to_vec();

    // re-delivery of the same request leaves the log untouched
    let (consistent, modified) = core.follower_append_entries(0, 0, &entries);
    assert!(consistent);
    assert!(!modified);
    assert_eq!(core.log_entries(), log_after_first.as_slice());
}

#[test]
fn test_core_follower_update_commit_index_capped_by_log_length() {
    let mut core = core_with_log_terms(&[1]);

    core.follower_update_commit_index(5);

    assert_eq!(core.commit_index(), 1);

    // never moves backwards
    core.follower_update_commit_index(0);
    assert_eq!(core.commit_index(), 1);
}

#[test]
fn test_core_leader_append_entry_requires_leadership() {
    let mut core = NodeCore::new(NODE_ID);

    assert!(!core.leader_append_entry("cmd".to_string()));
    assert_eq!(core.log_last_index(), 0);

    core.transition_to_candidate();
    core.transition_to_leader(&[NODE_ID, 1, 2]);

    assert!(core.leader_append_entry("cmd".to_string()));
    assert_eq!(core.log_last_index(), 1);
    assert_eq!(core.log_last_term(), 1);
}

#[test]
fn test_core_leader_commits_once_majority_matches() {
    const TOTAL_NODES: u64 = 5;
    let mut core = NodeCore::new(NODE_ID);
    core.transition_to_candidate(); // term 1
    core.transition_to_leader(&[0, 1, 2, 3, 4]);

    for cmd in ["a", "b", "c"] {
        assert!(core.leader_append_entry(cmd.to_string()));
    }

    // first follower acks all three entries: 2 of 5 replicas, no commit
    let (advanced, _, new_ci) = core.leader_process_append_response(1, true, 0, 3, TOTAL_NODES);
    assert!(!advanced);
    assert_eq!(new_ci, 0);
    assert_eq!(core.match_index_for(1), Some(3));
    assert_eq!(core.next_index_for(1), Some(4));

    // second follower acks: 3 of 5 replicas hold index 3, commit advances
    let (advanced, old_ci, new_ci) = core.leader_process_append_response(2, true, 0, 3, TOTAL_NODES);
    assert!(advanced);
    assert_eq!(old_ci, 0);
    assert_eq!(new_ci, 3);
}

#[test]
fn test_core_leader_never_commits_old_term_entry_by_counting() {
    const TOTAL_NODES: u64 = 3;
    // a term-1 entry inherited from an earlier leadership
    let mut core = core_with_log_terms(&[1]);
    core.transition_to_candidate(); // term 1
    core.transition_to_follower(2);
    core.transition_to_candidate(); // term 3
    core.transition_to_leader(&[0, 1, 2]);

    // a majority holds the old entry, but it is not from term 3: no commit
    let (advanced, _, new_ci) = core.leader_process_append_response(1, true, 0, 1, TOTAL_NODES);
    assert!(!advanced);
    assert_eq!(new_ci, 0);

    // replicating a current-term entry on a majority commits both
    assert!(core.leader_append_entry("current".to_string()));
    let (advanced, _, new_ci) = core.leader_process_append_response(1, true, 1, 1, TOTAL_NODES);
    assert!(advanced);
    assert_eq!(new_ci, 2);
}

#[test]
fn test_core_leader_backs_off_next_index_on_rejection() {
    const TOTAL_NODES: u64 = 3;
    let mut core = core_with_log_terms(&[1, 1]);
    core.transition_to_candidate(); // term 1
    core.transition_to_leader(&[0, 1, 2]);
    assert_eq!(core.next_index_for(1), Some(3));

    core.leader_process_append_response(1, false, 2, 0, TOTAL_NODES);
    assert_eq!(core.next_index_for(1), Some(2));

    core.leader_process_append_response(1, false, 1, 0, TOTAL_NODES);
    assert_eq!(core.next_index_for(1), Some(1));

    // never below 1
    core.leader_process_append_response(1, false, 0, 0, TOTAL_NODES);
    assert_eq!(core.next_index_for(1), Some(1));
}

#[test]
fn test_core_ignores_append_response_when_not_leader() {
    let mut core = NodeCore::new(NODE_ID);

    let (advanced, old_ci, new_ci) = core.leader_process_append_response(1, true, 0, 3, 3);

    assert!(!advanced);
    assert_eq!(old_ci, new_ci);
    assert_eq!(core.match_index_for(1), None);
}

#[test]
fn test_core_from_persisted_resumes_as_follower() {
    const TERM: u64 = 5;
    let entries = vec![entry(1, "a"), entry(5, "b")];
    let core = NodeCore::from_persisted(
        NODE_ID,
        TERM,
        Some(2),
        Box::new(InMemoryLog::from_entries(entries)),
    );

    assert_eq!(core.state(), NodeState::Follower);
    assert_eq!(core.current_term(), TERM);
    assert_eq!(core.voted_for(), Some(2));
    assert_eq!(core.log_last_index(), 2);
    assert_eq!(core.log_last_term(), 5);
    // volatile state restarts at zero and is recovered via replication
    assert_eq!(core.commit_index(), 0);
    assert_eq!(core.last_applied(), 0);
}

#[test]
fn test_core_set_last_applied_never_passes_commit_index() {
    let mut core = core_with_log_terms(&[1]);
    core.follower_update_commit_index(1);

    core.set_last_applied(5);

    assert_eq!(core.last_applied(), 1);
}

//! Property-based tests for skybridge's wire and sanitization primitives.
//!
//! These use `proptest` to verify invariants across thousands of random
//! inputs — round-trip laws, idempotence, and structural invariants that
//! example-based tests can only spot-check.
//!
//! # How to run
//!
//! ```bash
//! cargo test --test property_tests
//!
//! # Increase case count for thorough testing (default is 256):
//! PROPTEST_CASES=10000 cargo test --test property_tests
//! ```
//!
//! # Testing strategy
//!
//! - **Envelope**: `unmarshal(marshal(e)) == e` for every known payload
//!   variant, with arbitrary identifier and counter values.
//! - **Sanitize**: lossy UTF-8 conversion is idempotent on arbitrary byte
//!   soup; truncation respects its byte bound and marker contract.
//! - **Job normalization**: the output prefix invariant holds for any
//!   job id / attempt id the store accepts.

use proptest::prelude::*;
use skybridge::protocol::{
    AccessAuth, AccessRef, Envelope, Heartbeat, JobAssigned, JobStatusReport, Payload, Register,
    RegisterAck, RequestJob,
};
use skybridge::sanitize::{sanitize_utf8, truncate_with_marker, TRUNCATION_MARKER};
use skybridge::store::{Job, JobStatus, JobType};

fn ident() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_-]{1,24}"
}

fn status() -> impl Strategy<Value = JobStatus> {
    prop_oneof![
        Just(JobStatus::Pending),
        Just(JobStatus::Assigned),
        Just(JobStatus::Running),
        Just(JobStatus::Succeeded),
        Just(JobStatus::Failed),
        Just(JobStatus::Canceled),
        Just(JobStatus::Lost),
    ]
}

fn payload() -> impl Strategy<Value = Payload> {
    prop_oneof![
        (ident(), ident(), ident(), 1u32..64).prop_map(|(a, t, h, m)| {
            Payload::Register(Register {
                agent_id: a,
                agent_token: t,
                hostname: h,
                max_concurrency: m,
            })
        }),
        (any::<bool>(), ident(), 1u64..120).prop_map(|(s, m, i)| {
            Payload::RegisterAck(RegisterAck {
                success: s,
                message: m,
                heartbeat_interval_sec: i,
            })
        }),
        (ident(), any::<bool>(), 0u32..64).prop_map(|(a, p, r)| {
            Payload::Heartbeat(Heartbeat {
                agent_id: a,
                paused: p,
                running_jobs: r,
            })
        }),
        ident().prop_map(|a| Payload::RequestJob(RequestJob { agent_id: a })),
        (ident(), 1i32..10, status(), ident(), ident()).prop_map(|(j, at, s, m, k)| {
            Payload::JobStatus(JobStatusReport {
                job_id: j,
                attempt_id: at,
                status: s,
                message: m,
                output_key: k,
                stdout: String::new(),
                stderr: String::new(),
            })
        }),
        (ident(), 1i32..10, ident(), any::<bool>()).prop_map(|(j, at, lease, with_input)| {
            Payload::JobAssigned(Box::new(JobAssigned {
                job_id: j.clone(),
                attempt_id: at,
                lease_id: lease,
                lease_ttl_sec: 0,
                input_access: with_input.then(|| AccessRef {
                    url: format!("http://store/b/in/{}", j),
                    auth: AccessAuth::SignedUrl,
                }),
                input_key: if with_input { format!("in/{}", j) } else { String::new() },
                output_access: AccessRef {
                    url: format!("http://store/b/jobs/{}/{}/output.bin", j, at),
                    auth: AccessAuth::SignedUrl,
                },
                output_prefix: format!("jobs/{}/{}/", j, at),
                output_key: format!("jobs/{}/{}/output.bin", j, at),
                command: "run {input} {output}".into(),
                job_type: JobType::Command,
                forward_http: None,
                input_forward_mode: Default::default(),
            }))
        }),
    ]
}

proptest! {
    /// Round-trip law: marshal then unmarshal reproduces the envelope for
    /// every known payload variant.
    #[test]
    fn prop_envelope_round_trips(agent_id in ident(), payload in payload()) {
        let envelope = Envelope::new(agent_id, payload);
        let raw = envelope.marshal().unwrap();
        let back = Envelope::unmarshal(&raw).unwrap();
        prop_assert_eq!(envelope, back);
    }

    /// Lossy UTF-8 sanitization is idempotent on arbitrary bytes.
    #[test]
    fn prop_sanitize_is_idempotent(bytes in proptest::collection::vec(any::<u8>(), 0..2048)) {
        let once = sanitize_utf8(&bytes);
        let twice = sanitize_utf8(once.as_bytes());
        prop_assert_eq!(once, twice);
    }

    /// Truncation keeps the content within `max` bytes plus the marker,
    /// stays on char boundaries, and leaves short input untouched.
    #[test]
    fn prop_truncate_respects_bound(s in ".{0,512}", max in 0usize..256) {
        let out = truncate_with_marker(&s, max);
        if s.len() <= max {
            prop_assert_eq!(out, s);
        } else {
            prop_assert!(out.ends_with(TRUNCATION_MARKER));
            prop_assert!(out.len() <= max + TRUNCATION_MARKER.len());
            let body = &out[..out.len() - TRUNCATION_MARKER.len()];
            prop_assert!(s.starts_with(body), "marker must be the only modification");
        }
    }

    /// Creation normalization always yields the canonical output prefix
    /// and keys only inside it.
    #[test]
    fn prop_normalized_jobs_hold_prefix_invariant(
        job_id in ident(),
        attempt in -3i32..5,
        key in "[a-z/.]{0,32}",
    ) {
        let mut job = Job::new(job_id.clone(), JobType::Command);
        job.output_bucket = "bucket".into();
        job.attempt_id = attempt;
        job.output_key = key;
        job.normalize();
        let expected = format!("jobs/{}/{}/", job_id, job.attempt_id);
        prop_assert!(job.attempt_id >= 1);
        prop_assert_eq!(&job.output_prefix, &expected);
        prop_assert!(
            job.output_key.is_empty() || job.output_key.starts_with(&expected),
            "output_key must live under the canonical prefix"
        );
    }
}

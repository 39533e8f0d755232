//! Decoding of every probe reply kind

use fcp::{Message, ProbeErrorType, ProbeOutcome, ProbeRequest, ProbeResult, ProbeType};

fn decode(kind: ProbeType, message: Message) -> ProbeOutcome {
    ProbeOutcome::from_message(kind, &message).expect("reply should decode")
}

#[test]
fn test_request_message_fields() {
    let message = ProbeRequest::new(ProbeType::StoreSize, 35).to_message("id-1");

    assert_eq!(message.name, "ProbeRequest");
    assert_eq!(message.identifier(), Some("id-1"));
    assert_eq!(message.get("Type"), Some("STORE_SIZE"));
    assert_eq!(message.get("HopsToLive"), Some("35"));
}

#[test]
fn test_every_result_kind_decodes() {
    let cases = vec![
        (
            ProbeType::Bandwidth,
            Message::new("ProbeBandwidth").with_field("OutputBandwidth", "12.5"),
            ProbeResult::Bandwidth { output_kib: 12.5 },
        ),
        (
            ProbeType::Build,
            Message::new("ProbeBuild").with_field("Build", "1466"),
            ProbeResult::Build { build: 1466 },
        ),
        (
            ProbeType::Identifier,
            Message::new("ProbeIdentifier")
                .with_field("ProbeIdentifier", "-8734012")
                .with_field("UptimePercent", "93"),
            ProbeResult::Identifier { identifier: -8734012, uptime_percent: 93 },
        ),
        (
            ProbeType::LinkLengths,
            Message::new("ProbeLinkLengths").with_field("LinkLengths", "0.01;0.2;0.005"),
            ProbeResult::LinkLengths { lengths: vec![0.01, 0.2, 0.005] },
        ),
        (
            ProbeType::Location,
            Message::new("ProbeLocation").with_field("Location", "0.7331"),
            ProbeResult::Location { location: 0.7331 },
        ),
        (
            ProbeType::StoreSize,
            Message::new("ProbeStoreSize").with_field("StoreSize", "40.0"),
            ProbeResult::StoreSize { gib: 40.0 },
        ),
        (
            ProbeType::Uptime48h,
            Message::new("ProbeUptime").with_field("UptimePercent", "50.5"),
            ProbeResult::Uptime48h { percent: 50.5 },
        ),
        (
            ProbeType::Uptime7d,
            Message::new("ProbeUptime").with_field("UptimePercent", "12"),
            ProbeResult::Uptime7d { percent: 12.0 },
        ),
    ];

    for (kind, message, expected) in cases {
        assert_eq!(expected.probe_type(), kind);
        assert_eq!(decode(kind, message), ProbeOutcome::Result(expected));
    }
}

#[test]
fn test_error_and_refusal_decode_for_any_kind() {
    let error = Message::new("ProbeError")
        .with_field("Type", "CANNOT_FORWARD")
        .with_field("Code", "7")
        .with_field("Local", "true");

    for kind in ProbeType::ALL {
        assert_eq!(
            decode(kind, error.clone()),
            ProbeOutcome::Error { kind: ProbeErrorType::CannotForward, code: Some(7), local: true }
        );
        assert_eq!(decode(kind, Message::new("ProbeRefused")), ProbeOutcome::Refused);
    }
}

#[test]
fn test_missing_and_invalid_fields() {
    let missing = Message::new("ProbeLocation");
    assert!(ProbeOutcome::from_message(ProbeType::Location, &missing).is_err());

    let invalid = Message::new("ProbeBuild").with_field("Build", "abc");
    assert!(ProbeOutcome::from_message(ProbeType::Build, &invalid).is_err());

    let bad_error = Message::new("ProbeError").with_field("Type", "EXPLODED");
    assert!(ProbeOutcome::from_message(ProbeType::Build, &bad_error).is_err());
}

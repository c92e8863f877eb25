//! Tests for the MessageData derive macro.

use serde::{Deserialize, Serialize};
use tickets_core::{DecodeError, MessageData, NamedMessage, UnexpectedMessage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SeatReserved {
    seat: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SeatReleased {
    seat: String,
    reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, tickets_derive::MessageData)]
enum SeatEvent {
    #[message(name = "SeatReserved_v1")]
    Reserved(SeatReserved),
    Released(SeatReleased),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CloseVenue {
    venue: String,
}

#[derive(Debug, Clone, PartialEq, tickets_derive::MessageData)]
enum VenueCommand {
    CloseVenue(CloseVenue),
}

fn reserved() -> SeatEvent {
    SeatEvent::Reserved(SeatReserved {
        seat: "A1".to_string(),
    })
}

#[test]
fn names_come_from_attribute_or_variant() {
    assert_eq!(reserved().message_name(), "SeatReserved_v1");
    assert_eq!(SeatReleased::NAME, "Released");
    assert_eq!(SeatEvent::message_names(), &["SeatReserved_v1", "Released"]);
}

#[test]
fn encode_writes_the_payload_only() {
    let payload = reserved().encode().unwrap();
    let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(json, serde_json::json!({ "seat": "A1" }));
}

#[test]
fn decode_uses_the_name_to_pick_the_variant() {
    let decoded = SeatEvent::decode("Released", br#"{"seat":"B2","reason":null}"#).unwrap();
    assert_eq!(
        decoded,
        SeatEvent::Released(SeatReleased {
            seat: "B2".to_string(),
            reason: None,
        })
    );
}

#[test]
fn decode_reports_unknown_and_malformed() {
    assert!(matches!(
        SeatEvent::decode("SeatSold_v1", b"{}"),
        Err(DecodeError::UnknownMessage(_))
    ));
    match SeatEvent::decode("SeatReserved_v1", b"{}") {
        Err(DecodeError::Malformed { name, .. }) => assert_eq!(name, "SeatReserved_v1"),
        other => panic!("expected malformed, got {:?}", other),
    }
}

#[test]
fn conversions_between_enum_and_payload() {
    let event: SeatEvent = SeatReserved {
        seat: "C3".to_string(),
    }
    .into();
    assert_eq!(event.message_name(), "SeatReserved_v1");

    let err = SeatReleased::try_from(event.clone()).unwrap_err();
    assert_eq!(
        err,
        UnexpectedMessage {
            expected: "Released",
            found: "SeatReserved_v1",
        }
    );
    assert_eq!(SeatReserved::try_from(event).unwrap().seat, "C3");
}

#[test]
fn single_variant_catalogues_are_supported() {
    let command = VenueCommand::from(CloseVenue {
        venue: "Main hall".to_string(),
    });
    let payload = command.encode().unwrap();
    assert_eq!(VenueCommand::decode("CloseVenue", &payload).unwrap(), command);
    assert_eq!(CloseVenue::try_from(command).unwrap().venue, "Main hall");
}

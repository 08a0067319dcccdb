//! Device session lifecycle tests
//!
//! Drives `DeviceSession` and `RecoveryClient` against the scripted backend:
//! - open sequence and failure cleanup
//! - claim retry
//! - identity decoding at open and through the descriptor probes
//! - reset handling
//! - operations on a closed session
//!
//! Run with: `cargo test -p host --test session_tests`

use host::error::{AcquisitionError, SessionError};
use host::test_utils::{DeviceScript, Event, ScriptedBackend};
use host::usb::{AcquirePolicy, ControlRequest, DeviceSession, OpenPolicy, RecoveryClient};
use protocol::{DeviceMode, UsbStatus};

const DFU: u16 = 0x1227;

const IDENTITY: &str = "CPID:8010 CPRV:11 CPFM:03 SCEP:01 BDID:0C ECID:001A2B3C4D5E6F70 \
                        IBFL:3C SRNM:[F4GTK1ABCDEF] SRTG:[iBoot-2696.0.0.1.33]";

fn open(backend: &ScriptedBackend) -> Result<DeviceSession<host::test_utils::ScriptedDevice>, SessionError> {
    DeviceSession::open(backend, DeviceMode::Dfu, &OpenPolicy::default())
}

fn position(events: &[Event], event: &Event) -> usize {
    events
        .iter()
        .position(|e| e == event)
        .unwrap_or_else(|| panic!("{:?} not in journal {:?}", event, events))
}

// ============================================================================
// Open and Close
// ============================================================================

mod open_close {
    use super::*;

    #[test]
    fn test_open_sequence() {
        let backend = ScriptedBackend::new().with_device(DeviceScript::new(DFU).with_serial(IDENTITY));
        let session = open(&backend).unwrap();

        assert!(session.is_open());
        assert_eq!(session.mode(), DFU);
        assert_eq!(session.location_id(), 0x1420_0000);
        assert_eq!(
            backend.events(),
            vec![
                Event::Enumerate {
                    product_id: Some(DFU)
                },
                Event::Claim { product_id: DFU },
                Event::SerialString,
                Event::Open,
                Event::SetConfiguration(1),
                Event::RegisterEventSource,
            ]
        );
    }

    #[test]
    fn test_close_releases_everything_once() {
        let backend = ScriptedBackend::new().with_device(DeviceScript::new(DFU));
        let mut session = open(&backend).unwrap();
        backend.clear_events();

        session.close();
        session.close();
        drop(session);

        assert_eq!(
            backend.events(),
            vec![Event::Close, Event::DeregisterEventSource, Event::Release]
        );
    }

    #[test]
    fn test_no_device() {
        let backend = ScriptedBackend::new().with_device(DeviceScript::new(0x1281));
        let err = open(&backend).err().unwrap();

        assert_eq!(
            err,
            SessionError::Acquisition(AcquisitionError::NoDevice {
                vendor_id: 0x05ac,
                product_id: DFU,
            })
        );
        assert_eq!(backend.count(&Event::Claim { product_id: 0x1281 }), 0);
    }

    #[test]
    fn test_first_candidate_wins() {
        let mut second = DeviceScript::new(DFU);
        second.location_id = 0x1430_0000;
        let backend = ScriptedBackend::new()
            .with_device(DeviceScript::new(DFU))
            .with_device(second);

        let session = open(&backend).unwrap();
        assert_eq!(session.location_id(), 0x1420_0000);
        assert_eq!(backend.count(&Event::Claim { product_id: DFU }), 1);
    }

    #[test]
    fn test_mode_mismatch_releases_device() {
        let mut script = DeviceScript::new(DFU);
        script.reported_product_id = Some(0x1281);
        let backend = ScriptedBackend::new().with_device(script);

        let err = open(&backend).err().unwrap();
        assert_eq!(
            err,
            SessionError::Acquisition(AcquisitionError::ModeMismatch {
                expected: DFU,
                actual: 0x1281,
            })
        );
        assert_eq!(backend.count(&Event::Open), 0);
        assert_eq!(backend.count(&Event::Release), 1);
    }

    #[test]
    fn test_open_rejected() {
        let mut script = DeviceScript::new(DFU);
        script.open_result = Err(UsbStatus::Access);
        let backend = ScriptedBackend::new().with_device(script);

        let err = open(&backend).err().unwrap();
        assert_eq!(
            err,
            SessionError::Acquisition(AcquisitionError::OpenRejected(UsbStatus::Access))
        );
        assert_eq!(backend.count(&Event::SetConfiguration(1)), 0);
        assert_eq!(backend.count(&Event::Release), 1);
    }

    #[test]
    fn test_configuration_failure_closes_device() {
        let mut script = DeviceScript::new(DFU);
        script.configuration_result = Err(UsbStatus::Pipe);
        let backend = ScriptedBackend::new().with_device(script);

        let err = open(&backend).err().unwrap();
        assert_eq!(
            err,
            SessionError::Acquisition(AcquisitionError::Configuration(UsbStatus::Pipe))
        );

        let events = backend.events();
        assert_eq!(backend.count(&Event::RegisterEventSource), 0);
        assert!(position(&events, &Event::Close) < position(&events, &Event::Release));
    }

    #[test]
    fn test_event_source_failure_closes_device() {
        let mut script = DeviceScript::new(DFU);
        script.event_source_result = Err(UsbStatus::Other(-99));
        let backend = ScriptedBackend::new().with_device(script);

        let err = open(&backend).err().unwrap();
        assert_eq!(
            err,
            SessionError::Acquisition(AcquisitionError::EventSource(UsbStatus::Other(-99)))
        );
        assert_eq!(backend.count(&Event::Close), 1);
        assert_eq!(backend.count(&Event::Release), 1);
    }
}

// ============================================================================
// Claim Retry
// ============================================================================

mod claim_retry {
    use super::*;

    #[test]
    fn test_transient_claim_failures() {
        let mut script = DeviceScript::new(DFU);
        script.claim_failures = 3;
        let backend = ScriptedBackend::new().with_device(script);

        assert!(open(&backend).is_ok());
        assert_eq!(backend.count(&Event::Claim { product_id: DFU }), 4);
    }

    #[test]
    fn test_claim_exhausted() {
        let mut script = DeviceScript::new(DFU);
        script.claim_failures = 5;
        script.claim_error = UsbStatus::NoDevice;
        let backend = ScriptedBackend::new().with_device(script);

        let err = open(&backend).err().unwrap();
        assert_eq!(
            err,
            SessionError::Acquisition(AcquisitionError::ClaimExhausted {
                attempts: 5,
                last: UsbStatus::NoDevice,
            })
        );
        assert_eq!(backend.count(&Event::Claim { product_id: DFU }), 5);
        assert_eq!(backend.count(&Event::Open), 0);
    }
}

// ============================================================================
// Identity
// ============================================================================

mod identity {
    use super::*;

    #[test]
    fn test_identity_decoded_at_open() {
        let backend = ScriptedBackend::new().with_device(DeviceScript::new(DFU).with_serial(IDENTITY));
        let session = open(&backend).unwrap();

        let info = session.device_info().unwrap();
        assert!(session.has_serial_string());
        assert_eq!(info.cpid, 0x8010);
        assert_eq!(info.bdid, 0x0c);
        assert_eq!(info.ecid, 0x001A_2B3C_4D5E_6F70);
        assert!(info.has_srnm);
        assert_eq!(info.srtg.as_deref(), Some("iBoot-2696.0.0.1.33"));
    }

    #[test]
    fn test_no_identity_string() {
        let backend = ScriptedBackend::new().with_device(DeviceScript::new(DFU));
        let session = open(&backend).unwrap();

        assert!(!session.has_serial_string());
        assert!(session.device_info().unwrap().is_empty());
    }

    #[test]
    fn test_probes_stop_once_tag_known() {
        let script = DeviceScript::new(DFU)
            .with_string_descriptor(6, "CPID:8010 BDID:0C")
            .with_string_descriptor(4, "SRTG:[iBoot-1145.3]")
            .with_string_descriptor(3, "CPID:FFFF");
        let backend = ScriptedBackend::new().with_device(script);
        let mut session = open(&backend).unwrap();
        backend.clear_events();

        assert!(session.query_self_identity().unwrap());
        assert!(session.has_serial_string());

        let probed: Vec<u16> = backend
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Control { value, .. } => Some(value),
                _ => None,
            })
            .collect();
        assert_eq!(probed, vec![0x0306, 0x0304]);

        // Fields from earlier slots survive later ones
        let info = session.device_info().unwrap();
        assert_eq!(info.cpid, 0x8010);
        assert_eq!(info.bdid, 0x0c);
        assert_eq!(info.srtg.as_deref(), Some("iBoot-1145.3"));
    }

    #[test]
    fn test_probe_requests_full_response() {
        let script = DeviceScript::new(DFU).with_string_descriptor(6, "SRTG:[iBoot-1]");
        let backend = ScriptedBackend::new().with_device(script);
        let mut session = open(&backend).unwrap();
        backend.clear_events();

        session.query_self_identity().unwrap();
        assert_eq!(
            backend.events(),
            vec![Event::Control {
                value: 0x0306,
                length: 256
            }]
        );
    }

    #[test]
    fn test_probes_stop_on_transfer_error() {
        let script = DeviceScript::new(DFU).with_string_descriptor(4, "SRTG:[iBoot-1]");
        let backend = ScriptedBackend::new().with_device(script);
        let mut session = open(&backend).unwrap();
        backend.clear_events();

        // Slot 6 stalls, so slot 4 is never read
        assert!(!session.query_self_identity().unwrap());
        assert_eq!(backend.count(&Event::Control { value: 0x0304, length: 256 }), 0);
        assert!(session.device_info().unwrap().srtg.is_none());
    }

    #[test]
    fn test_no_probe_when_tag_already_known() {
        let backend = ScriptedBackend::new().with_device(DeviceScript::new(DFU).with_serial(IDENTITY));
        let mut session = open(&backend).unwrap();
        backend.clear_events();

        assert!(session.query_self_identity().unwrap());
        assert!(backend.events().is_empty());
    }
}

// ============================================================================
// Configuration and Reset
// ============================================================================

mod device_control {
    use super::*;

    #[test]
    fn test_set_configuration() {
        let backend = ScriptedBackend::new().with_device(DeviceScript::new(DFU));
        let mut session = open(&backend).unwrap();

        session.set_configuration(2).unwrap();
        assert_eq!(backend.count(&Event::SetConfiguration(2)), 1);
    }

    #[test]
    fn test_reset_tolerates_unresponsive_device() {
        let mut script = DeviceScript::new(DFU);
        script.reset_result = Err(UsbStatus::NotResponding);
        script.reenumerate_result = Err(UsbStatus::NoDevice);
        let backend = ScriptedBackend::new().with_device(script);
        let mut session = open(&backend).unwrap();
        backend.clear_events();

        session.reset_and_reenumerate().unwrap();
        assert_eq!(backend.events(), vec![Event::Reset, Event::Reenumerate]);
    }

    #[test]
    fn test_reset_failure() {
        let mut script = DeviceScript::new(DFU);
        script.reset_result = Err(UsbStatus::Access);
        let backend = ScriptedBackend::new().with_device(script);
        let mut session = open(&backend).unwrap();

        assert_eq!(
            session.reset_and_reenumerate(),
            Err(SessionError::Reset(UsbStatus::Access))
        );
        assert_eq!(backend.count(&Event::Reenumerate), 0);
    }
}

// ============================================================================
// Closed Sessions
// ============================================================================

mod closed_session {
    use super::*;

    #[test]
    fn test_operations_after_close() {
        let backend = ScriptedBackend::new().with_device(DeviceScript::new(DFU).with_serial(IDENTITY));
        let mut session = open(&backend).unwrap();
        session.close();
        backend.clear_events();

        let request = ControlRequest::new(0x21, 0x01, 0, 0);
        let mut buf = [0u8; 4];
        assert_eq!(
            session.transfer(request, &mut buf),
            Err(SessionError::InvalidSession)
        );
        assert_eq!(session.abort(), Err(SessionError::InvalidSession));
        assert_eq!(session.set_configuration(1), Err(SessionError::InvalidSession));
        assert_eq!(session.reset_and_reenumerate(), Err(SessionError::InvalidSession));
        assert_eq!(session.query_self_identity(), Err(SessionError::InvalidSession));
        assert!(session.device_info().is_none());
        assert!(!session.has_serial_string());

        // Nothing reached the device
        assert!(backend.events().is_empty());
    }

    #[test]
    fn test_client_without_session() {
        let backend = ScriptedBackend::new();
        let mut client = RecoveryClient::new(backend, OpenPolicy::default(), AcquirePolicy::default());

        assert!(!client.is_open());
        assert!(client.device_info().is_none());
        assert_eq!(client.session().err(), Some(SessionError::InvalidSession));
    }
}

// ============================================================================
// Single Owner
// ============================================================================

mod single_owner {
    use super::*;

    #[test]
    fn test_open_twice_releases_first_session() {
        let backend = ScriptedBackend::new().with_device(DeviceScript::new(DFU));
        let journal = backend.journal();
        let mut client = RecoveryClient::new(backend, OpenPolicy::default(), AcquirePolicy::default());

        client.open(DeviceMode::Dfu).unwrap();
        client.open(DeviceMode::Dfu).unwrap();
        assert!(client.is_open());

        let events = journal.borrow().clone();
        let claims: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| **e == Event::Claim { product_id: DFU })
            .map(|(i, _)| i)
            .collect();
        assert_eq!(claims.len(), 2);

        let release = position(&events, &Event::Release);
        assert!(release < claims[1]);
        assert!(position(&events, &Event::Close) < release);
    }

    #[test]
    fn test_client_drop_releases_session() {
        let backend = ScriptedBackend::new().with_device(DeviceScript::new(DFU));
        let journal = backend.journal();
        let mut client = RecoveryClient::new(backend, OpenPolicy::default(), AcquirePolicy::default());
        client.open(DeviceMode::Dfu).unwrap();

        drop(client);
        let events = journal.borrow().clone();
        assert_eq!(events.iter().filter(|e| **e == Event::Release).count(), 1);
        assert_eq!(events.last(), Some(&Event::Release));
    }

    #[test]
    fn test_failed_open_leaves_client_closed() {
        let backend = ScriptedBackend::new().with_device(DeviceScript::new(DFU));
        let mut client = RecoveryClient::new(backend, OpenPolicy::default(), AcquirePolicy::default());

        client.open(DeviceMode::Dfu).unwrap();
        assert!(client.open(DeviceMode::Recovery(1)).is_err());
        assert!(!client.is_open());
        assert_eq!(client.backend().count(&Event::Release), 1);
    }
}

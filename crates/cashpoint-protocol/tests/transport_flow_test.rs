//! End-to-end transport exchanges against a scripted peer.
//!
//! These tests run the transport actor over a `tokio::io::duplex` pipe
//! and hand-script the device side of the conversation byte by byte, so
//! every acknowledge/retransmit path is exercised without hardware.

use bytes::Bytes;
use cashpoint_core::constants::{ACK, NAK, RESPONSE_ADDR};
use cashpoint_protocol::{
    CommandCode, Frame, ResponseFrame, ResponseStatus, Transport, TransportConfig, TransportError,
};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// Read one complete command frame from the host side of the pipe.
async fn read_command(stream: &mut DuplexStream) -> Frame {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.unwrap();
    let len = usize::from(u16::from_be_bytes([header[2], header[3]]));

    let mut rest = vec![0u8; len + 1];
    stream.read_exact(&mut rest).await.unwrap();

    let mut bytes = header.to_vec();
    bytes.extend_from_slice(&rest);
    Frame::parse(&bytes).unwrap()
}

fn positive_response(command: CommandCode, parameter: u8, payload: &[u8]) -> Bytes {
    ResponseFrame::new(
        RESPONSE_ADDR,
        command.as_u8(),
        parameter,
        ResponseStatus::Positive,
        payload,
    )
    .unwrap()
    .encode()
}

#[tokio::test]
async fn happy_path_resolves_with_stripped_payload() {
    let (host, mut device) = tokio::io::duplex(256);
    let (handle, _task) = Transport::spawn(host, TransportConfig::default());

    let script = tokio::spawn(async move {
        let frame = read_command(&mut device).await;
        assert_eq!(frame.command(), CommandCode::Status);
        assert_eq!(frame.address(), RESPONSE_ADDR);

        device.write_all(&[ACK]).await.unwrap();
        device
            .write_all(&positive_response(CommandCode::Status, 0x00, &[0x11, 0x22]))
            .await
            .unwrap();

        // The host acknowledges the verified response.
        let mut ack = [0u8; 1];
        device.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack[0], ACK);
    });

    let payload = handle
        .send_command(CommandCode::Status, 0x00, &[])
        .await
        .unwrap();
    assert_eq!(payload.as_ref(), &[0x11, 0x22]);

    script.await.unwrap();
}

#[tokio::test]
async fn nak_on_send_surfaces_as_nak_error() {
    let (host, mut device) = tokio::io::duplex(256);
    let (handle, _task) = Transport::spawn(host, TransportConfig::default());

    let script = tokio::spawn(async move {
        let _ = read_command(&mut device).await;
        device.write_all(&[NAK]).await.unwrap();
    });

    let err = handle
        .send_command(CommandCode::Enable, 0x00, &[])
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Nak));

    script.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn silent_device_times_out_in_the_ack_phase() {
    let (host, mut device) = tokio::io::duplex(256);
    let (handle, _task) = Transport::spawn(host, TransportConfig::default());

    // Consume the command but never answer.
    let script = tokio::spawn(async move {
        let _ = read_command(&mut device).await;
        // Keep the pipe open so the host hits the deadline, not EOF.
        tokio::time::sleep(Duration::from_secs(60)).await;
    });

    let err = handle
        .send_command(CommandCode::Status, 0x00, &[])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransportError::Timeout {
            phase: cashpoint_protocol::transport::Phase::Ack,
            ..
        }
    ));

    script.abort();
}

#[tokio::test(start_paused = true)]
async fn handle_stays_usable_after_a_timeout() {
    let (host, mut device) = tokio::io::duplex(256);
    let (handle, _task) = Transport::spawn(host, TransportConfig::default());

    let script = tokio::spawn(async move {
        // First command: swallow it.
        let _ = read_command(&mut device).await;
        // Second command: answer properly.
        let frame = read_command(&mut device).await;
        device.write_all(&[ACK]).await.unwrap();
        device
            .write_all(&positive_response(frame.command(), frame.parameter(), &[0x01]))
            .await
            .unwrap();
        let mut ack = [0u8; 1];
        device.read_exact(&mut ack).await.unwrap();
    });

    let err = handle
        .send_command(CommandCode::Status, 0x00, &[])
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Timeout { .. }));

    let payload = handle
        .send_command(CommandCode::Status, 0x00, &[])
        .await
        .unwrap();
    assert_eq!(payload.as_ref(), &[0x01]);

    script.await.unwrap();
}

#[tokio::test]
async fn corrupted_checksum_triggers_exactly_one_nak_then_recovers() {
    let (host, mut device) = tokio::io::duplex(256);
    let (handle, _task) = Transport::spawn(host, TransportConfig::default());

    let script = tokio::spawn(async move {
        let frame = read_command(&mut device).await;
        device.write_all(&[ACK]).await.unwrap();

        // First response: flip the checksum byte.
        let good = positive_response(frame.command(), frame.parameter(), &[0x77]);
        let mut bad = good.to_vec();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        device.write_all(&bad).await.unwrap();

        // The host must answer with exactly one NAK and keep waiting.
        let mut nak = [0u8; 1];
        device.read_exact(&mut nak).await.unwrap();
        assert_eq!(nak[0], NAK);

        // Retransmit correctly; the host acknowledges.
        device.write_all(&good).await.unwrap();
        let mut ack = [0u8; 1];
        device.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack[0], ACK);
    });

    let payload = handle
        .send_command(CommandCode::Status, 0x00, &[])
        .await
        .unwrap();
    assert_eq!(payload.as_ref(), &[0x77]);

    script.await.unwrap();
}

#[tokio::test]
async fn persistent_checksum_failure_surfaces_after_one_retry() {
    let (host, mut device) = tokio::io::duplex(256);
    let (handle, _task) = Transport::spawn(host, TransportConfig::default());

    let script = tokio::spawn(async move {
        let frame = read_command(&mut device).await;
        device.write_all(&[ACK]).await.unwrap();

        let good = positive_response(frame.command(), frame.parameter(), &[]);
        let mut bad = good.to_vec();
        let last = bad.len() - 1;
        bad[last] ^= 0x55;

        // Corrupt on the original transmission and on the retry.
        device.write_all(&bad).await.unwrap();
        let mut nak = [0u8; 1];
        device.read_exact(&mut nak).await.unwrap();
        assert_eq!(nak[0], NAK);
        device.write_all(&bad).await.unwrap();
    });

    let err = handle
        .send_command(CommandCode::Status, 0x00, &[])
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Checksum { retries: 1 }));

    script.await.unwrap();
}

#[tokio::test]
async fn device_fault_response_is_a_typed_error() {
    let (host, mut device) = tokio::io::duplex(256);
    let (handle, _task) = Transport::spawn(host, TransportConfig::default());

    let script = tokio::spawn(async move {
        let frame = read_command(&mut device).await;
        device.write_all(&[ACK]).await.unwrap();
        let fault = ResponseFrame::new(
            RESPONSE_ADDR,
            frame.command().as_u8(),
            frame.parameter(),
            ResponseStatus::Error { code: 0x0304 },
            &[],
        )
        .unwrap();
        device.write_all(&fault.encode()).await.unwrap();
        let mut ack = [0u8; 1];
        device.read_exact(&mut ack).await.unwrap();
    });

    let err = handle
        .send_command(CommandCode::Dispense, 0x00, &[0x02])
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Device { code: 0x0304, .. }));

    script.await.unwrap();
}

#[tokio::test]
async fn second_command_waits_for_the_first_to_resolve() {
    let (host, mut device) = tokio::io::duplex(1024);
    let (handle, _task) = Transport::spawn(host, TransportConfig::default());

    let script = tokio::spawn(async move {
        // First command arrives alone; the pipe must hold nothing further
        // until the first call resolves.
        let first = read_command(&mut device).await;
        assert_eq!(first.command(), CommandCode::Enable);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut probe = [0u8; 1];
        let pending =
            tokio::time::timeout(Duration::from_millis(20), device.read_exact(&mut probe)).await;
        assert!(pending.is_err(), "second command transmitted too early");

        device.write_all(&[ACK]).await.unwrap();
        device
            .write_all(&positive_response(first.command(), first.parameter(), &[]))
            .await
            .unwrap();
        let mut ack = [0u8; 1];
        device.read_exact(&mut ack).await.unwrap();

        // Only now does the second command hit the wire.
        let second = read_command(&mut device).await;
        assert_eq!(second.command(), CommandCode::Disable);
        device.write_all(&[ACK]).await.unwrap();
        device
            .write_all(&positive_response(second.command(), second.parameter(), &[]))
            .await
            .unwrap();
        let mut ack = [0u8; 1];
        device.read_exact(&mut ack).await.unwrap();
    });

    let first = handle.send_command(CommandCode::Enable, 0x00, &[]);
    let second = handle.send_command(CommandCode::Disable, 0x00, &[]);
    let (first, second) = tokio::join!(first, second);
    first.unwrap();
    second.unwrap();

    script.await.unwrap();
}

#[tokio::test]
async fn closed_stream_reports_transport_closed() {
    let (host, device) = tokio::io::duplex(64);
    let config = TransportConfig::default();
    let (handle, task) = Transport::spawn(host, config);

    drop(device);
    // Give the actor a moment to observe EOF and stop.
    let _ = tokio::time::timeout(Duration::from_millis(500), task).await;

    let err = handle
        .send_command(CommandCode::Status, 0x00, &[])
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Closed));
}

//! End-to-end uploads against a scripted receiver on a loopback socket.

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use avrcal::config::TransferConfig;
use avrcal::frame::{decode, Decoded, Frame, DEVICE_MARKER};
use avrcal::{run_transfer, AvrSession, CalError, CalibrationFile};

const INFO: &str = r#"{"DType":"float","EQType":"MultEQXT32","CoefWaitTime":{"Init":0}}"#;
const STATUS: &str = r#"{"ChSetup":[{"FL":"S"},{"FR":"S"},{"C":"S"},{"SWMIX1":"E"}],
    "AmpAssign":"Standard","AssignBin":"00","SWSetup":{"SWNum":1}}"#;

fn device_json(cmd: &str, json: &str) -> Vec<u8> {
    let mut frame = Frame::json(cmd, json);
    frame.marker = DEVICE_MARKER;
    frame.encode().unwrap()
}

/// Host frames the receiver saw, as (command, payload) pairs.
type Seen = Vec<(String, Vec<u8>)>;

/// Accept one connection and answer every frame until the host hangs up.
/// `nak_coefdt` rejects the first SET_COEFDT frame.
async fn spawn_receiver(nak_coefdt: bool) -> (u16, JoinHandle<Seen>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut seen = Vec::new();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let mut rejected = false;
        loop {
            let n = match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            buf.extend_from_slice(&chunk[..n]);
            while let Decoded::Frame { frame, consumed } = decode(&buf) {
                buf.drain(..consumed);
                let reply = match frame.command.as_str() {
                    "GET_AVRINF" => device_json("GET_AVRINF", INFO),
                    "GET_AVRSTS" => device_json("GET_AVRSTS", STATUS),
                    "SET_COEFDT" if nak_coefdt && !rejected => {
                        rejected = true;
                        b"NAK".to_vec()
                    }
                    _ => b"ACK".to_vec(),
                };
                seen.push((frame.command, frame.payload));
                if stream.write_all(&reply).await.is_err() {
                    return seen;
                }
            }
        }
        seen
    });
    (port, handle)
}

fn config(port: u16) -> TransferConfig {
    TransferConfig {
        port,
        command_ms: 1000,
        packet_pacing_ms: 0,
        curve_pacing_ms: 0,
        ..TransferConfig::default()
    }
}

fn calibration() -> CalibrationFile {
    let channel = |id: &str, kind: &str, taps: usize| {
        json!({
            "commandId": id, "speakerType": kind, "distanceInMeters": 3.2,
            "trimAdjustmentInDbs": -1.5, "xover": 80,
            "filter": vec![0.125; taps], "filterLV": vec![0.25; taps]
        })
    };
    let doc = json!({
        "eqType": 2, "lpfForLFE": 120, "bassMode": "LFE", "ampAssignInfo": "00",
        "channels": [
            channel("FL", "S", 16321),
            channel("FR", "S", 16321),
            channel("SW1", "E", 16055)
        ]
    });
    CalibrationFile::from_json_str(&doc.to_string()).unwrap()
}

fn commands(seen: &Seen) -> Vec<&str> {
    seen.iter().map(|(c, _)| c.as_str()).collect()
}

#[tokio::test]
async fn uploads_xt32_calibration_over_tcp() {
    let (port, receiver) = spawn_receiver(false).await;
    let mut session = AvrSession::connect("127.0.0.1", config(port)).await.unwrap();

    let summary = run_transfer(&mut session, &calibration()).await.unwrap();
    assert_eq!(summary.channels, vec!["FL", "FR", "SWMIX1"]);
    assert_eq!(summary.untouched, vec!["C"]);

    let seen = receiver.await.unwrap();
    let cmds = commands(&seen);
    assert_eq!(&cmds[..3], &["GET_AVRINF", "GET_AVRSTS", "ENTER_AUDY"]);
    assert_eq!(&cmds[cmds.len() - 3..], &["FINZ_COEFS", "SET_SETDAT", "EXIT_AUDMD"]);
    let coef_frames = cmds.iter().filter(|c| **c == "SET_COEFDT").count();
    assert_eq!(coef_frames, summary.coefficient_frames);

    // Parameters go out before any coefficient data.
    let first_coef = cmds.iter().position(|c| *c == "SET_COEFDT").unwrap();
    let params: String = seen[3..first_coef]
        .iter()
        .map(|(_, p)| String::from_utf8_lossy(p).into_owned())
        .collect();
    assert!(params.contains("\"ChLevel\""));
    assert!(params.contains("\"Distance\""));

    let (_, fin) = &seen[seen.len() - 2];
    assert_eq!(fin.as_slice(), br#"{"AudyFinFlg":"Fin"}"#);
}

#[tokio::test]
async fn rejected_coefficients_exit_calibration_mode() {
    let (port, receiver) = spawn_receiver(true).await;
    let mut session = AvrSession::connect("127.0.0.1", config(port)).await.unwrap();

    let err = run_transfer(&mut session, &calibration()).await.unwrap_err();
    assert!(matches!(err, CalError::ProtocolReject { .. }), "{err:?}");
    assert!(!session.is_connected().await);

    let seen = receiver.await.unwrap();
    let cmds = commands(&seen);
    assert_eq!(cmds.last(), Some(&"EXIT_AUDMD"));
    assert!(!cmds.contains(&"FINZ_COEFS"));
}

#[tokio::test]
async fn unreachable_receiver_fails_to_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    assert!(AvrSession::connect("127.0.0.1", config(port)).await.is_err());
}

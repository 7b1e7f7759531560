fn main() {
    println!("Run `cargo test -p loopback` to execute the end-to-end loopback tests.");
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::Mutex;

    use chromabridge_client::{BackoffSchedule, BridgeClient, BridgeConfig, BridgeEvent, Endpoint};
    use chromabridge_protocol::constants::MessageKind;
    use chromabridge_protocol::messages::BridgeMessage;
    use chromabridge_protocol::types::{
        CalibrationResult, CalibrationStatus, DeviceInfo, DeviceSnapshot, LabColor,
        MeasurementType, ModeReading, Readings,
    };
    use chromabridge_server::{BridgeServer, Handler, HandlerFuture, Sender, ServerConfig};

    /// Stand-in for the device-management component: answers the request
    /// catalog from canned data.
    struct InstrumentStub {
        device: DeviceSnapshot,
        /// Per-request artificial latency for status replies, popped in
        /// arrival order. Empty queue means answer immediately.
        status_delays: Mutex<VecDeque<Duration>>,
        /// When set, calibration requests are swallowed without a reply.
        mute_calibration: bool,
    }

    impl InstrumentStub {
        fn with_device() -> Self {
            Self {
                device: DeviceSnapshot {
                    connected: true,
                    make: Some("X-Rite".into()),
                    model: Some("i1Pro3".into()),
                    serial_number: Some("SN-100234".into()),
                    calibration: Some(CalibrationStatus {
                        calibrated: true,
                        expires_at: None,
                    }),
                },
                status_delays: Mutex::new(VecDeque::new()),
                mute_calibration: false,
            }
        }

        fn readings(modes: &[String]) -> Readings {
            let mut out = HashMap::new();
            for mode in modes {
                out.insert(
                    mode.clone(),
                    ModeReading {
                        spectral: Some(vec![0.42; 36]),
                        lab: Some(LabColor {
                            l: 53.1,
                            a: 1.2,
                            b: -0.8,
                        }),
                    },
                );
            }
            out
        }
    }

    impl Handler for InstrumentStub {
        fn on_device_status(&self, sender: Sender, request_id: String) -> HandlerFuture<'_> {
            Box::pin(async move {
                let delay = self.status_delays.lock().await.pop_front();
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                let _ = sender.send_msg(&BridgeMessage::DeviceStatusResponse {
                    request_id,
                    device: self.device.clone(),
                });
            })
        }

        fn on_calibration_start(&self, sender: Sender, request_id: String) -> HandlerFuture<'_> {
            Box::pin(async move {
                if self.mute_calibration {
                    return;
                }
                let _ = sender.send_msg(&BridgeMessage::CalibrationComplete {
                    request_id,
                    calibration: CalibrationResult {
                        expires_at: Some(chrono::Utc::now() + chrono::Duration::hours(8)),
                    },
                    device: None,
                });
            })
        }

        fn on_measurement_trigger(
            &self,
            sender: Sender,
            request_id: String,
            modes: Vec<String>,
            _measurement_type: MeasurementType,
        ) -> HandlerFuture<'_> {
            Box::pin(async move {
                let _ = sender.send_msg(&BridgeMessage::MeasurementResult {
                    request_id,
                    result: Self::readings(&modes),
                });
            })
        }
    }

    async fn spawn_server(
        handler: InstrumentStub,
    ) -> (Arc<BridgeServer<InstrumentStub>>, u16) {
        spawn_server_on(handler, 0).await
    }

    async fn spawn_server_on(
        handler: InstrumentStub,
        port: u16,
    ) -> (Arc<BridgeServer<InstrumentStub>>, u16) {
        let server = BridgeServer::new(ServerConfig { port }, handler);
        let run = server.clone();
        tokio::spawn(async move {
            let _ = run.run().await;
        });
        // Wait until the listener is bound.
        for _ in 0..50 {
            if server.port().await != 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let port = server.port().await;
        assert_ne!(port, 0, "server failed to bind");
        (server, port)
    }

    fn client_config(port: u16) -> BridgeConfig {
        BridgeConfig {
            endpoints: vec![Endpoint::plain("127.0.0.1", port)],
            attempt_timeout: Duration::from_secs(3),
            backoff: BackoffSchedule::new(vec![Duration::from_millis(50)]),
            ..BridgeConfig::default()
        }
    }

    #[tokio::test]
    async fn connect_falls_back_past_dead_candidate() {
        let (_server, port) = spawn_server(InstrumentStub::with_device()).await;

        let config = BridgeConfig {
            endpoints: vec![
                Endpoint::plain("127.0.0.1", 1), // nothing listening
                Endpoint::plain("127.0.0.1", port),
            ],
            attempt_timeout: Duration::from_secs(1),
            ..BridgeConfig::default()
        };
        let client = BridgeClient::new(config).unwrap();

        client.connect().await.unwrap();
        assert!(client.is_connected().await);
        assert_eq!(
            client.connected_url().await.as_deref(),
            Some(format!("ws://127.0.0.1:{port}").as_str())
        );
    }

    #[tokio::test]
    async fn status_probe_seeds_device_snapshot() {
        let (_server, port) = spawn_server(InstrumentStub::with_device()).await;
        let client = BridgeClient::new(client_config(port)).unwrap();

        client.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let snap = client.snapshot();
        assert!(snap.bridge.connected);
        assert!(snap.device.connected);
        let info = snap.device.info.expect("probe should report the device");
        assert_eq!(info.serial_number, "SN-100234");
        assert!(snap.calibration.calibrated);
    }

    #[tokio::test]
    async fn measurement_round_trip_updates_snapshot() {
        let (_server, port) = spawn_server(InstrumentStub::with_device()).await;
        let client = BridgeClient::new(client_config(port)).unwrap();
        client.connect().await.unwrap();

        let readings = client
            .trigger_measurement(vec!["M0".into(), "M2".into()], MeasurementType::Spot)
            .await
            .unwrap();
        assert_eq!(readings.len(), 2);
        assert!(readings["M0"].spectral.is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let snap = client.snapshot();
        assert!(!snap.measurement.measuring);
        assert!(snap.measurement.last_result.is_some());
    }

    #[tokio::test]
    async fn out_of_order_responses_settle_their_own_requests() {
        let stub = InstrumentStub::with_device();
        {
            // First slot is eaten by the automatic probe on connect; the
            // second slows down the first explicit request.
            let mut delays = stub.status_delays.try_lock().unwrap();
            delays.push_back(Duration::ZERO);
            delays.push_back(Duration::from_millis(400));
        }
        let (_server, port) = spawn_server(stub).await;

        let client = BridgeClient::new(client_config(port)).unwrap();
        client.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // First request eats the 400 ms delay; the second answers at once.
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let slow = {
            let client = client.clone();
            let order = order.clone();
            tokio::spawn(async move {
                client.device_status().await.unwrap();
                order.lock().unwrap().push("slow");
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let fast = {
            let client = client.clone();
            let order = order.clone();
            tokio::spawn(async move {
                client.device_status().await.unwrap();
                order.lock().unwrap().push("fast");
            })
        };

        slow.await.unwrap();
        fast.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["fast", "slow"]);
    }

    #[tokio::test]
    async fn push_events_reach_listeners_and_snapshot() {
        let (server, port) = spawn_server(InstrumentStub::with_device()).await;
        let client = BridgeClient::new(client_config(port)).unwrap();
        client.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        client.on(
            MessageKind::DeviceConnected,
            Box::new(move |ev| {
                if let BridgeEvent::Wire(BridgeMessage::DeviceConnected { device }) = ev {
                    seen_clone.lock().unwrap().push(device.serial_number.clone());
                }
            }),
        );

        let sender = server.client_sender().await.unwrap();
        sender
            .push_device_connected(DeviceInfo {
                make: "X-Rite".into(),
                model: "i1Pro3".into(),
                serial_number: "SN-55".into(),
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["SN-55".to_string()]);
        let snap = client.snapshot();
        assert_eq!(snap.device.info.unwrap().serial_number, "SN-55");

        // Detach resets the device and calibration axes.
        sender.push_device_disconnected().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let snap = client.snapshot();
        assert!(!snap.device.connected);
        assert!(snap.device.info.is_none());
        assert!(!snap.calibration.calibrated);
    }

    #[tokio::test]
    async fn hardware_measurement_push_updates_result() {
        let (server, port) = spawn_server(InstrumentStub::with_device()).await;
        let client = BridgeClient::new(client_config(port)).unwrap();
        client.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let seen = Arc::new(std::sync::Mutex::new(0u32));
        let seen_clone = seen.clone();
        client.on(
            MessageKind::MeasurementCompleted,
            Box::new(move |_| *seen_clone.lock().unwrap() += 1),
        );

        // Button press on the instrument: no request, no pending entry.
        let modes = vec!["M1".to_string()];
        let sender = server.client_sender().await.unwrap();
        sender
            .push_measurement_completed(InstrumentStub::readings(&modes))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*seen.lock().unwrap(), 1);
        let snap = client.snapshot();
        let result = snap.measurement.last_result.unwrap();
        assert!(result.contains_key("M1"));
    }

    #[tokio::test]
    async fn timed_out_request_leaves_session_usable() {
        let stub = InstrumentStub {
            mute_calibration: true,
            ..InstrumentStub::with_device()
        };
        let (_server, port) = spawn_server(stub).await;

        let mut config = client_config(port);
        config.request_timeout = Duration::from_millis(300);
        let client = BridgeClient::new(config).unwrap();
        client.connect().await.unwrap();

        let result = client.start_calibration().await;
        assert!(matches!(
            result,
            Err(chromabridge_client::ClientError::Timeout)
        ));
        assert!(!client.snapshot().calibration.calibrating);

        // The session survives; unrelated requests still settle.
        let device = client.device_status().await.unwrap();
        assert!(device.connected);
    }

    #[tokio::test]
    async fn unreachable_bridge_raises_not_installed_once() {
        let config = BridgeConfig {
            endpoints: vec![Endpoint::plain("127.0.0.1", 1)],
            attempt_timeout: Duration::from_millis(200),
            backoff: BackoffSchedule::new(vec![Duration::from_millis(50)]),
            not_installed_after: 2,
            ..BridgeConfig::default()
        };
        let client = BridgeClient::new(config).unwrap();

        let raised = Arc::new(std::sync::Mutex::new(0u32));
        let raised_clone = raised.clone();
        client.on(
            MessageKind::BridgeNotInstalled,
            Box::new(move |ev| {
                if matches!(ev, BridgeEvent::NotInstalled { .. }) {
                    *raised_clone.lock().unwrap() += 1;
                }
            }),
        );

        assert!(client.connect().await.is_err());
        // Let the retry loop fail a few more full cycles.
        tokio::time::sleep(Duration::from_millis(800)).await;
        client.disconnect().await;

        assert_eq!(*raised.lock().unwrap(), 1);
        assert!(client.snapshot().bridge.not_installed);
    }

    #[tokio::test]
    async fn force_reconnect_rebuilds_a_working_session() {
        let (_server, port) = spawn_server(InstrumentStub::with_device()).await;
        let client = BridgeClient::new(client_config(port)).unwrap();
        client.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        client.force_reconnect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(client.is_connected().await);
        let device = client.device_status().await.unwrap();
        assert!(device.connected);
    }

    #[tokio::test]
    async fn late_bridge_connect_does_not_bounce_session() {
        // Reserve a port the bridge is not yet listening on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let config = BridgeConfig {
            endpoints: vec![Endpoint::plain("127.0.0.1", port)],
            attempt_timeout: Duration::from_millis(200),
            backoff: BackoffSchedule::new(vec![Duration::from_millis(500)]),
            ..BridgeConfig::default()
        };
        let client = BridgeClient::new(config).unwrap();

        // First connect fails and arms the retry timer.
        assert!(client.connect().await.is_err());

        let (_server, _) = spawn_server_on(InstrumentStub::with_device(), port).await;

        let transitions = Arc::new(std::sync::Mutex::new(Vec::new()));
        let transitions_clone = transitions.clone();
        client.on(
            MessageKind::Connection,
            Box::new(move |ev| {
                if let BridgeEvent::Connection { connected } = ev {
                    transitions_clone.lock().unwrap().push(*connected);
                }
            }),
        );

        // A direct connect while the timer is pending must disarm it; the
        // stale timer must not reopen a socket over the live session.
        client.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(900)).await;

        assert!(client.is_connected().await);
        assert_eq!(*transitions.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn unexpected_disconnect_reconnects_automatically() {
        let (server, port) = spawn_server(InstrumentStub::with_device()).await;
        let client = BridgeClient::new(client_config(port)).unwrap();
        client.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let drops = Arc::new(std::sync::Mutex::new(Vec::new()));
        let drops_clone = drops.clone();
        client.on(
            MessageKind::Connection,
            Box::new(move |ev| {
                if let BridgeEvent::Connection { connected } = ev {
                    drops_clone.lock().unwrap().push(*connected);
                }
            }),
        );

        server.disconnect_client().await;
        // 50 ms backoff step; give the loop time to re-establish.
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(client.is_connected().await);
        let transitions = drops.lock().unwrap().clone();
        assert_eq!(transitions.first(), Some(&false));
        assert_eq!(transitions.last(), Some(&true));
    }
}

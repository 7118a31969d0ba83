use printhost_communication::firmware::reprap::{checksum, LineProtocol, RepRapProtocol};
use printhost_communication::{
    Direction, DriverConfig, ExtrusionConfig, ExtrusionUpdater, FatalCondition, ProtocolDriver,
    VirtualPrinter,
};
use printhost_core::{DriverError, Error, ProtocolError};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(2);

fn config() -> DriverConfig {
    DriverConfig {
        max_buffer_size: 128,
        five_d: true,
        handshake_timeout: Duration::from_millis(500),
        handshake_retries: 2,
        pulse_reset: false,
        reset_settle: Duration::from_millis(200),
        post_connect: Vec::new(),
        stop_instruction: "M410".to_string(),
    }
}

fn connect(printer: &VirtualPrinter, config: DriverConfig) -> ProtocolDriver {
    ProtocolDriver::connect(printer.transport(), config).unwrap()
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn reset_line() -> String {
    format!("N0 M110 *{}", checksum(b"N0 M110 "))
}

#[test]
fn test_first_line_after_handshake_is_n1() {
    let printer = VirtualPrinter::new();
    let driver = connect(&printer, config());

    driver.send("G1 X10 Y10 F500").unwrap();
    assert!(printer.wait_for_written(2, WAIT));

    let written = printer.written_lines();
    assert_eq!(written[0], reset_line());
    assert_eq!(
        written[1],
        format!("N1 G1 X10 Y10 F500 *{}", checksum(b"N1 G1 X10 Y10 F500 "))
    );
    assert!(driver.wait_until_finished(WAIT));
}

#[test]
fn test_post_connect_instructions_follow_handshake() {
    let printer = VirtualPrinter::new();
    let mut config = config();
    config.post_connect = vec!["G90".to_string(), "M82".to_string()];
    let driver = connect(&printer, config);

    assert!(printer.wait_for_written(3, WAIT));
    let written = printer.written_lines();
    assert!(written[1].starts_with("N1 G90 *"));
    assert!(written[2].starts_with("N2 M82 *"));
    assert_eq!(driver.line_number(), 2);
}

#[test]
fn test_resend_retransmits_oldest_line_verbatim() {
    let printer = VirtualPrinter::new();
    let driver = connect(&printer, config());
    printer.set_auto_ack(false);
    printer.clear_written();

    driver.send("G1 X1").unwrap();
    driver.send("G1 X2").unwrap();
    assert_eq!(printer.written_lines().len(), 2);

    printer.inject_response("Resend:1");
    assert!(printer.wait_for_written(3, WAIT));

    let written = printer.written_lines();
    assert_eq!(written.len(), 3);
    assert_eq!(written[2], written[0]);
    assert!(!driver.is_finished());

    printer.acknowledge(2);
    assert!(driver.wait_until_finished(WAIT));
}

#[test]
fn test_mismatched_resend_resynchronizes_once() {
    let printer = VirtualPrinter::new();
    let driver = connect(&printer, config());
    printer.set_auto_ack(false);
    printer.clear_written();

    driver.send("G1 X1").unwrap();
    driver.send("G1 X2").unwrap();
    printer.inject_response("Resend:5");
    assert!(printer.wait_for_written(4, WAIT));

    let written = printer.written_lines();
    assert_eq!(written[2], reset_line());
    assert_eq!(written[3], written[0]);
    assert_eq!(
        written[2..].iter().filter(|l| l.contains("M110")).count(),
        1
    );
}

#[test]
fn test_unreadable_resend_target_resynchronizes() {
    let printer = VirtualPrinter::new();
    let driver = connect(&printer, config());
    printer.set_auto_ack(false);
    printer.clear_written();

    driver.send("G1 X1").unwrap();
    printer.inject_response("Resend: garbage");
    assert!(printer.wait_for_written(3, WAIT));

    let written = printer.written_lines();
    assert_eq!(written[1], reset_line());
    assert_eq!(written[2], written[0]);
    assert_eq!(driver.queue_depth(), 2);
}

#[test]
fn test_checksum_failures_recover_end_to_end() {
    let printer = VirtualPrinter::new();
    let driver = connect(&printer, config());

    printer.fail_next_checksum();
    for x in 1..=3 {
        driver.send(&format!("G1 X{}", x)).unwrap();
    }

    assert!(driver.wait_until_finished(WAIT));
    assert!(driver.fatal_condition().is_none());
}

#[test]
fn test_sender_blocks_until_capacity_frees() {
    let printer = VirtualPrinter::new();
    let mut config = config();
    config.max_buffer_size = 30;
    let driver = Arc::new(connect(&printer, config));
    printer.set_auto_ack(false);
    printer.clear_written();

    driver.send("G1 X10 Y10").unwrap();
    let sender = {
        let driver = Arc::clone(&driver);
        thread::spawn(move || driver.send("G1 X20 Y20"))
    };

    thread::sleep(Duration::from_millis(100));
    assert_eq!(printer.written_lines().len(), 1);
    assert!(driver.in_flight_bytes() <= 30);

    printer.acknowledge(1);
    assert!(sender.join().unwrap().is_ok());
    assert_eq!(printer.written_lines().len(), 2);
}

#[test]
fn test_interrupt_wakes_blocked_sender() {
    let printer = VirtualPrinter::new();
    let mut config = config();
    config.max_buffer_size = 30;
    let driver = Arc::new(connect(&printer, config));
    printer.set_auto_ack(false);
    printer.clear_written();

    driver.send("G1 X10 Y10").unwrap();
    let sender = {
        let driver = Arc::clone(&driver);
        thread::spawn(move || driver.send("G1 X20 Y20"))
    };
    thread::sleep(Duration::from_millis(50));

    driver.interrupt().unwrap();
    let result = sender.join().unwrap();
    assert!(matches!(result, Err(Error::Driver(DriverError::Aborted))));
    assert_eq!(printer.written_lines().last().map(String::as_str), Some("M410"));

    // The first ok belongs to the numbered line written before the stop line
    printer.acknowledge(1);
    assert!(wait_for(|| driver.queue_depth() == 0));
    assert_eq!(driver.in_flight_bytes(), 0);

    printer.acknowledge(1);
    assert!(driver.wait_until_finished(WAIT));

    assert!(matches!(
        driver.send("G28"),
        Err(Error::Driver(DriverError::Aborted))
    ));
    driver.resume_sending();
    printer.set_auto_ack(true);
    driver.send("G28").unwrap();
    assert!(driver.wait_until_finished(WAIT));
}

#[test]
fn test_acknowledgments_after_interrupt_settle_in_order() {
    let printer = VirtualPrinter::new();
    let driver = connect(&printer, config());
    printer.set_auto_ack(false);

    for instruction in ["G1 X1 F600", "G1 X2", "G1 X3"] {
        driver.send(instruction).unwrap();
    }
    driver.interrupt().unwrap();

    let mut bytes = driver.in_flight_bytes();
    assert!(bytes > 0);
    for remaining in [2, 1, 0] {
        printer.acknowledge(1);
        assert!(wait_for(|| driver.queue_depth() == remaining));
        let now = driver.in_flight_bytes();
        assert!(now < bytes, "{} should be below {}", now, bytes);
        bytes = now;
    }
    assert_eq!(bytes, 0);

    // The stop line's own ok must not be taken by the next numbered line
    printer.acknowledge(1);
    thread::sleep(Duration::from_millis(50));
    driver.resume_sending();
    driver.send("G1 X4").unwrap();
    assert_eq!(driver.queue_depth(), 1);
    printer.acknowledge(1);
    assert!(wait_for(|| driver.queue_depth() == 0));
}

#[test]
fn test_control_line_skips_a_full_buffer() {
    let printer = VirtualPrinter::new();
    let mut config = config();
    config.max_buffer_size = 30;
    let driver = Arc::new(connect(&printer, config));
    printer.set_auto_ack(false);
    printer.clear_written();

    driver.send("G1 X10 Y10").unwrap();
    let sender = {
        let driver = Arc::clone(&driver);
        thread::spawn(move || driver.send("G1 X20 Y20"))
    };
    thread::sleep(Duration::from_millis(50));

    driver.send_control("M104 S0").unwrap();
    assert_eq!(printer.written_lines().last().map(String::as_str), Some("M104 S0"));
    assert_eq!(driver.tool_status().target_temperature, 0.0);

    // On the wire: the first numbered line, the control line, then the unblocked line
    printer.acknowledge(1);
    sender.join().unwrap().unwrap();
    printer.acknowledge(2);
    assert!(driver.wait_until_finished(WAIT));
}

#[test]
fn test_fault_is_fatal() {
    let printer = VirtualPrinter::new();
    let driver = connect(&printer, config());
    let (tx, rx) = mpsc::channel();
    driver.set_fatal_hook(Box::new(move |condition| {
        let _ = tx.send(condition.clone());
    }));

    printer.inject_response("Extruder Fail: thermistor open");
    let condition = rx.recv_timeout(WAIT).unwrap();
    assert!(matches!(condition, FatalCondition::Fault(_)));

    let err = driver.send("G28").unwrap_err();
    assert!(err.is_fatal_device_error());
}

#[test]
fn test_unplugged_transport_loses_connection() {
    let printer = VirtualPrinter::new();
    let driver = connect(&printer, config());

    printer.unplug();
    assert!(wait_for(|| matches!(
        driver.fatal_condition(),
        Some(FatalCondition::ConnectionLost(_))
    )));
    assert!(driver.send("G28").unwrap_err().is_connection_error());
}

#[test]
fn test_handshake_timeout_fails_cleanly() {
    let printer = VirtualPrinter::new();
    printer.set_auto_ack(false);
    let mut config = config();
    config.handshake_timeout = Duration::from_millis(50);

    let err = ProtocolDriver::connect(printer.transport(), config)
        .err()
        .unwrap();
    assert!(err.is_timeout());

    let written = printer.written_lines();
    assert_eq!(written, vec![reset_line(), reset_line()]);
}

#[test]
fn test_reset_pulse_waits_for_banner() {
    let printer = VirtualPrinter::new();
    let mut config = config();
    config.pulse_reset = true;
    let driver = connect(&printer, config);
    assert!(driver.start_received());
    assert_eq!(driver.line_number(), 0);
}

#[test]
fn test_temperatures_are_tracked() {
    let printer = VirtualPrinter::new();
    let driver = connect(&printer, config());

    driver.send("M104 S200").unwrap();
    driver.send("M140 S60").unwrap();
    driver.send("M105").unwrap();
    assert!(driver.wait_until_finished(WAIT));

    let status = driver.tool_status();
    assert_eq!(status.temperature, 200.0);
    assert_eq!(status.target_temperature, 200.0);
    assert_eq!(status.platform_temperature, 60.0);
    assert_eq!(status.platform_target_temperature, 60.0);
}

#[test]
fn test_line_too_long_is_rejected() {
    let printer = VirtualPrinter::new();
    let mut config = config();
    config.max_buffer_size = 16;
    let driver = connect(&printer, config);

    let err = driver.send("G1 X100 Y100 Z100").unwrap_err();
    assert!(matches!(
        err,
        Error::Protocol(ProtocolError::LineTooLong { capacity: 16, .. })
    ));
}

#[test]
fn test_comment_only_instruction_sends_nothing() {
    let printer = VirtualPrinter::new();
    let driver = connect(&printer, config());
    driver.send("; layer 1").unwrap();
    driver.send("M101").unwrap();
    assert_eq!(printer.written_lines().len(), 1);
    assert_eq!(driver.line_number(), 0);
}

#[test]
fn test_explicit_line_reset_restarts_numbering() {
    let printer = VirtualPrinter::new();
    let driver = connect(&printer, config());
    driver.send("G28").unwrap();
    driver.send("M110 N10").unwrap();
    driver.send("G1 X1").unwrap();
    assert!(printer.wait_for_written(4, WAIT));

    let protocol = RepRapProtocol::default();
    let written = printer.written_lines();
    assert_eq!(written[2], protocol.frame(10, "M110"));
    assert_eq!(protocol.line_number_of(&written[3]), Some(11));
    assert!(driver.wait_until_finished(WAIT));
}

#[test]
fn test_extrusion_updater_over_driver() {
    let printer = VirtualPrinter::new();
    let driver = Arc::new(connect(&printer, config()));
    let updater = ExtrusionUpdater::new(
        driver.clone(),
        ExtrusionConfig {
            period: Duration::from_millis(500),
            max_queued: 2,
            tool: 0,
        },
    );

    updater.enable(600.0, Direction::Forward);
    assert_eq!(updater.distance_per_tick(), 5.0);
    updater.tick().unwrap();
    assert!(driver.wait_until_finished(WAIT));

    let protocol = RepRapProtocol::default();
    let written = printer.written_lines();
    assert_eq!(written[written.len() - 1], protocol.frame(2, "G1 E5 F600"));
    assert_eq!(driver.e_position(), 5.0);
    assert_eq!(driver.feedrate(), 600.0);
}

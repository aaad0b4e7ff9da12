//! Integration tests for board shutdown ordering.

use std::sync::Arc;
use std::time::{Duration, Instant};

use periph_board::config::{AnalogConfig, BoardConfig, I2cConfig, SpiConfig};
use periph_board::platform::MockEvent;
use periph_board::{Board, BoardModel, MockPlatform};

fn full_config() -> BoardConfig {
    BoardConfig {
        spis: vec![SpiConfig {
            name: "main".into(),
            bus_select: "0".into(),
        }],
        i2cs: vec![I2cConfig {
            name: "sensors".into(),
            bus: "1".into(),
        }],
        analogs: vec![AnalogConfig {
            name: "pot".into(),
            pin: "0".into(),
            spi_bus: "main".into(),
            chip_select: "0".into(),
            average_over_ms: 50,
            samples_per_sec: 100,
        }],
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pulse_loops_stop_before_handles_close() {
    let platform = Arc::new(MockPlatform::with_lines(["GPIO4", "GPIO5"]));
    let board = Board::new(BoardModel::periph(), &full_config(), platform.clone())
        .await
        .expect("Failed to build board");
    board.set_pulse("GPIO4", 0.5, 200.0).await.unwrap();
    board.set_pulse("GPIO5", 0.3, 150.0).await.unwrap();
    let bus = board.spi_by_name("main").await.unwrap();
    let analog = board.analog_by_name("pot").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    board.close().await;

    let events = platform.events();
    let first_close = events
        .iter()
        .position(|e| matches!(e, MockEvent::I2cClose { .. }))
        .expect("I2C bus was not closed");
    let last_level = events
        .iter()
        .rposition(|e| matches!(e, MockEvent::Level { .. }))
        .expect("no pulses recorded");
    assert!(last_level < first_close);

    assert!(bus.is_closed());
    assert!(analog.read().await.unwrap_err().is_closed());
    assert!(board.spi_by_name("main").await.is_none());

    let settled = platform.events().len();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(platform.events().len(), settled);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_close_interrupts_long_periods() {
    let platform = Arc::new(MockPlatform::with_lines(["GPIO4"]));
    let board = Board::new(BoardModel::periph(), &BoardConfig::default(), platform)
        .await
        .unwrap();
    // One pulse every two seconds.
    board.set_pulse("GPIO4", 0.5, 0.5).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    board.close().await;

    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn test_closed_board_rejects_pin_use() {
    let platform = Arc::new(MockPlatform::with_lines(["GPIO4"]));
    let board = Board::new(BoardModel::periph(), &BoardConfig::default(), platform)
        .await
        .unwrap();
    let pin = board.gpio_pin_by_name("GPIO4").await.unwrap();

    board.close().await;

    assert!(pin.set(true).await.unwrap_err().is_closed());
    assert!(pin.set_pwm(0.5).await.unwrap_err().is_closed());
    assert!(board.set_pulse("GPIO4", 0.5, 10.0).await.unwrap_err().is_closed());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reconfigure_racing_close_with_running_loop() {
    let platform = Arc::new(MockPlatform::with_lines(["GPIO4"]));
    let board = Board::new(BoardModel::periph(), &full_config(), platform.clone())
        .await
        .expect("Failed to build board");
    board
        .set_pulse("GPIO4", 0.5, 200.0)
        .await
        .expect("Failed to set pulse");
    tokio::time::sleep(Duration::from_millis(30)).await;

    // Leaves the I2C bus alone so its only close comes from shutdown.
    let mut changed = full_config();
    changed.spis[0].bus_select = "1".into();
    changed.analogs[0].chip_select = "1".into();

    let (reconfigured, ()) = tokio::join!(board.reconfigure(&changed), board.close());
    if let Err(e) = reconfigured {
        assert!(e.is_closed(), "unexpected error: {e:?}");
    }

    let events = platform.events();
    let first_close = events
        .iter()
        .position(|e| matches!(e, MockEvent::I2cClose { .. }))
        .expect("I2C bus was not closed");
    let last_level = events
        .iter()
        .rposition(|e| matches!(e, MockEvent::Level { .. }))
        .expect("no pulses recorded");
    assert!(last_level < first_close);
    assert!(board.i2c_by_name("sensors").await.is_none());
    assert!(board.reconfigure(&changed).await.expect_err("closed board reconfigured").is_closed());
}

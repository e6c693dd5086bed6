//! Tests for the shipped node configuration.

use mooring_daq::config::{ConnectionSettings, PowerSwitchSettings, Settings};
use mooring_daq::power::PowerPolicy;
use mooring_daq::schedule::SampleSchedule;
use std::time::Duration;

#[test]
fn test_shipped_config_is_valid() {
    let settings = Settings::load_from("config/mooring.toml").expect("config/mooring.toml loads");
    settings.validate().expect("config/mooring.toml is valid");

    assert_eq!(settings.dispatcher.pool_size, 10);
    assert_eq!(settings.dispatcher.keep_awake, Duration::from_secs(300));
    assert_eq!(settings.enabled_instruments().len(), 2);

    let ctd = settings.instrument("ctd").expect("ctd");
    assert_eq!(ctd.power_policy, PowerPolicy::WhenSampling);
    assert!(matches!(ctd.power_switch, PowerSwitchSettings::Sysfs { .. }));
    assert!(matches!(ctd.connection, ConnectionSettings::Serial { baud: 9600, .. }));
    assert_eq!(ctd.sample_schedule().expect("schedule").nominal_period_secs(), 60);
    let detector = ctd.detector.as_ref().expect("ctd detector");
    assert_eq!(detector.sta_width_sec, 300);

    let fluorometer = settings.instrument("1002").expect("lookup by id");
    assert!(matches!(
        fluorometer.sample_schedule().expect("schedule"),
        SampleSchedule::Calendar(_)
    ));
    assert!(fluorometer.detector.is_none());
}

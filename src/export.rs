use std::{error::Error, io};

use chrono::{DateTime, Utc};
use csv::Writer;
use serde::Serialize;

use crate::controller::{RecoveryOutput, TaskDecision};

/// Writes `<prefix>-flights.csv` and `<prefix>-maintenances.csv`.
pub fn export_recovery(output: &RecoveryOutput, filename_prefix: &str) -> Result<(), Box<dyn Error>> {
    let mut flight_writer = Writer::from_path(format!("{}-flights.csv", filename_prefix))?;
    write_decisions(&mut flight_writer, &output.flights)?;
    let mut maintenance_writer = Writer::from_path(format!("{}-maintenances.csv", filename_prefix))?;
    write_decisions(&mut maintenance_writer, &output.maintenances)?;
    Ok(())
}

#[derive(Serialize)]
struct DecisionRecord<'a> {
    key: &'a str,
    kind: &'a str,
    flight_number: &'a str,
    original_tail: &'a str,
    tail: &'a str,
    origin: &'a str,
    dest: &'a str,
    cancelled: u8,
    rerouted: u8,
    delay_minutes: i64,
    dep_time: String,
    arr_time: String,
    sched_dep: String,
    sched_arr: String,
}

pub fn write_decisions<W: io::Write>(
    writer: &mut Writer<W>,
    decisions: &[TaskDecision],
) -> Result<(), Box<dyn Error>> {
    for decision in decisions {
        writer.serialize(DecisionRecord {
            key: &decision.key,
            kind: decision.kind,
            flight_number: decision.flight_number.as_deref().unwrap_or(""),
            original_tail: decision.original_aircraft.as_deref().unwrap_or(""),
            tail: decision.recovered_aircraft.as_deref().unwrap_or(""),
            origin: &decision.origin,
            dest: &decision.dest,
            cancelled: u8::from(decision.cancelled),
            rerouted: u8::from(decision.rerouted),
            delay_minutes: decision.delay_minutes,
            dep_time: decision.dep_time.as_ref().map(format_datetime).unwrap_or_default(),
            arr_time: decision.arr_time.as_ref().map(format_datetime).unwrap_or_default(),
            sched_dep: format_datetime(&decision.sched_dep),
            sched_arr: format_datetime(&decision.sched_arr),
        })?;
    }
    writer.flush()?;
    Ok(())
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    format!("{}", dt.format("%Y-%m-%d %H:%M:%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::at;

    fn decision(key: &str, cancelled: bool) -> TaskDecision {
        TaskDecision {
            key: key.to_string(),
            kind: "flight",
            flight_number: Some(key.to_uppercase()),
            original_aircraft: Some("B-1".to_string()),
            recovered_aircraft: (!cancelled).then(|| "B-2".to_string()),
            origin: "PEK".to_string(),
            dest: "SHA".to_string(),
            rerouted: false,
            sched_dep: at(60),
            sched_arr: at(180),
            dep_time: (!cancelled).then(|| at(75)),
            arr_time: (!cancelled).then(|| at(195)),
            delay_minutes: if cancelled { 0 } else { 15 },
            cancelled,
        }
    }

    #[test]
    fn decisions_become_one_row_each() {
        let mut writer = Writer::from_writer(Vec::new());
        write_decisions(&mut writer, &[decision("f1", false), decision("f2", true)]).unwrap();
        let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("key,kind,flight_number,original_tail,tail"));
        assert_eq!(
            lines[1],
            "f1,flight,F1,B-1,B-2,PEK,SHA,0,0,15,2024-05-01 01:15:00,2024-05-01 03:15:00,2024-05-01 01:00:00,2024-05-01 03:00:00"
        );
        assert!(lines[2].starts_with("f2,flight,F2,B-1,,PEK,SHA,1,0,0,,,"));
    }
}

pub mod aircraft;
pub mod airport;
pub mod bunch;
pub mod controller;
pub mod export;
pub mod graph;
pub mod initial;
pub mod iteration;
pub mod master;
pub mod metrics;
pub mod model;
pub mod pricer;
pub mod rules;
pub mod scenario;
pub mod selector;
pub mod shadow;
pub mod solver;
pub mod task;

#[cfg(test)]
mod test_support;

pub use controller::{run, run_with_rules, RecoveryError, RecoveryOutput, StopToken, TaskDecision};
pub use model::{RecoveryConfig, RecoveryInput};

#[cfg(feature = "node")]
mod node {
    use chrono::{DateTime, Utc};
    use neon::prelude::*;
    use neon::types::JsDate;

    use crate::{
        controller::{self, RecoveryOutput, StopToken, TaskDecision},
        scenario::{ScenarioLoader, SqliteScenarioLoader},
    };

    macro_rules! try_load {
        ( $cx:expr, $load_op:expr ) => {{
            let maybe = $load_op;
            match maybe {
                Err(error) => {
                    let message = format!("Failed to load scenario: {:?}", error);
                    return $cx.throw_error(message);
                }
                Ok(value) => value,
            }
        }};
    }

    macro_rules! object_set {
        ( $cx:expr, $obj:expr, $key:expr, $val:expr ) => {
            let item = $val;
            // Can't mutably borrow $cx multiple times at once, hence the above statement
            $obj.set(&mut *$cx, $key, item)?;
        };
    }

    fn js_date<'a>(cx: &mut FunctionContext<'a>, time: &DateTime<Utc>) -> JsResult<'a, JsDate> {
        match cx.date(time.timestamp_millis() as f64) {
            Ok(date) => Ok(date),
            Err(error) => cx.throw_range_error(format!("{:?}", error)),
        }
    }

    fn encode_decision<'a>(cx: &mut FunctionContext<'a>, decision: &TaskDecision) -> JsResult<'a, JsObject> {
        let obj = cx.empty_object();
        object_set!(cx, obj, "kind", cx.string(decision.kind));
        object_set!(cx, obj, "origin", cx.string(&decision.origin));
        object_set!(cx, obj, "dest", cx.string(&decision.dest));
        if let Some(number) = &decision.flight_number {
            object_set!(cx, obj, "flight_number", cx.string(number));
        }
        if let Some(tail) = &decision.recovered_aircraft {
            object_set!(cx, obj, "tail", cx.string(tail));
        }
        if let (Some(dep), Some(arr)) = (&decision.dep_time, &decision.arr_time) {
            let start = js_date(cx, dep)?;
            object_set!(cx, obj, "start", start);
            let end = js_date(cx, arr)?;
            object_set!(cx, obj, "end", end);
        }
        object_set!(cx, obj, "delay", cx.number(decision.delay_minutes as f64));
        object_set!(cx, obj, "rerouted", cx.boolean(decision.rerouted));
        object_set!(cx, obj, "cancelled", cx.boolean(decision.cancelled));
        Ok(obj)
    }

    fn encode_output<'a>(cx: &mut FunctionContext<'a>, output: &RecoveryOutput) -> JsResult<'a, JsObject> {
        let flights = cx.empty_object();
        for decision in &output.flights {
            let encoded = encode_decision(cx, decision)?;
            object_set!(cx, flights, decision.key.as_str(), encoded);
        }
        let maintenances = cx.empty_object();
        for decision in &output.maintenances {
            let encoded = encode_decision(cx, decision)?;
            object_set!(cx, maintenances, decision.key.as_str(), encoded);
        }

        let obj = cx.empty_object();
        object_set!(cx, obj, "success", cx.boolean(output.success));
        if let Some(objective) = output.objective {
            object_set!(cx, obj, "objective", cx.number(objective));
        }
        if let Some(bound) = output.lower_bound {
            object_set!(cx, obj, "lower_bound", cx.number(bound));
        }
        if let Some(error) = &output.error {
            let err = cx.empty_object();
            object_set!(cx, err, "code", cx.number(error.code));
            object_set!(cx, err, "message", cx.string(&error.message));
            object_set!(cx, obj, "error", err);
        }
        object_set!(cx, obj, "iterations", cx.number(output.counters.iterations as f64));
        object_set!(cx, obj, "flights", flights);
        object_set!(cx, obj, "maintenances", maintenances);
        Ok(obj)
    }

    fn run_recovery(mut cx: FunctionContext) -> JsResult<JsObject> {
        let path = cx.argument::<JsString>(0)?.value(&mut cx);
        let scenario = cx.argument::<JsString>(1)?.value(&mut cx);
        let loader = try_load!(&mut cx, SqliteScenarioLoader::new(&path, scenario));
        let config = try_load!(&mut cx, loader.read_config());
        let input = try_load!(&mut cx, loader.read_input());

        let output = controller::run(&input, &config, None, StopToken::new());
        encode_output(&mut cx, &output)
    }

    #[neon::main]
    fn main(mut cx: ModuleContext) -> NeonResult<()> {
        cx.export_function("runRecovery", run_recovery)?;
        Ok(())
    }
}

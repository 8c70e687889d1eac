//! Maps the operator's business-rule rejections to user-facing messages.
//!
//! The engine API signals these only through message text, so this is the single
//! place that matches on substrings. Errors are already classified as `Validation`
//! from the response code and reason before they get here.

use mdai_core::{MdaiError, TelemetryFilter};

pub fn filter_rejection(err: MdaiError, filter: &TelemetryFilter) -> MdaiError {
    match err {
        MdaiError::Validation(msg) => MdaiError::Validation(translate(&msg, filter).unwrap_or(msg)),
        other => other,
    }
}

fn translate(msg: &str, filter: &TelemetryFilter) -> Option<String> {
    if msg.contains(&format!("Filter name {} is not unique", filter.name)) {
        return Some(format!("filter name \"{}\" already exists in config", filter.name));
    }
    for p in filter.pipelines() {
        if msg.contains(&format!("pipeline {} not found in config", p)) {
            return Some(format!("pipeline \"{}\" not found in config", p));
        }
        if msg.contains(&format!("Pipeline {} is muted in several filters", p)) {
            return Some(format!("pipeline \"{}\" is muted in another filter", p));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f() -> TelemetryFilter { TelemetryFilter::new("quiet").muting(vec!["metrics/a".into(), "logs/b".into()]) }

    #[test]
    fn known_rejections_are_rewritten() {
        let cases = [
            ("admission webhook denied the request: Filter name quiet is not unique", "filter name \"quiet\" already exists in config"),
            ("denied: pipeline logs/b not found in config", "pipeline \"logs/b\" not found in config"),
            ("denied: Pipeline metrics/a is muted in several filters", "pipeline \"metrics/a\" is muted in another filter"),
        ];
        for (remote, want) in cases {
            match filter_rejection(MdaiError::Validation(remote.into()), &f()) {
                MdaiError::Validation(m) => assert_eq!(m, want),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn unknown_messages_and_other_classes_pass_through() {
        match filter_rejection(MdaiError::Validation("spec.foo: Invalid value".into()), &f()) {
            MdaiError::Validation(m) => assert_eq!(m, "spec.foo: Invalid value"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(filter_rejection(MdaiError::NotFound("x".into()), &f()).is_not_found());
    }
}

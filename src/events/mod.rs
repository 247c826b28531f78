use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One scheduled macro event from the calendar file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EconomicEvent {
    pub id: String,
    pub name: String,
    /// YYYY-MM-DD.
    pub date: String,
    /// HH:MM UTC; midnight when absent.
    #[serde(default = "default_event_time")]
    pub time: String,
    pub impact: String,
    pub category: String,
}

fn default_event_time() -> String {
    "00:00".to_string()
}

impl EconomicEvent {
    pub fn occurs_at(&self) -> Option<DateTime<Utc>> {
        let date = NaiveDate::parse_from_str(&self.date, "%Y-%m-%d").ok()?;
        let time = NaiveTime::parse_from_str(&self.time, "%H:%M").ok()?;
        Some(date.and_time(time).and_utc())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPhase {
    None,
    Post,
    Pre,
    During,
}

impl EventPhase {
    pub fn position_ratio_multiplier(&self) -> Decimal {
        match self {
            EventPhase::Pre => dec!(0.5),
            EventPhase::During => Decimal::ZERO,
            EventPhase::Post => dec!(0.7),
            EventPhase::None => Decimal::ONE,
        }
    }
}

/// Current throttle state derived from the calendar. The multiplier
/// scales the effective position ratio; zero suspends entries outright.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRiskState {
    pub phase: EventPhase,
    pub position_ratio_multiplier: Decimal,
    pub expires_at: Option<DateTime<Utc>>,
    pub event_name: Option<String>,
}

impl EventRiskState {
    pub fn inactive() -> Self {
        Self {
            phase: EventPhase::None,
            position_ratio_multiplier: Decimal::ONE,
            expires_at: None,
            event_name: None,
        }
    }
}

/// Evaluate all events at `now`. Windows, all UTC: pre = [t-24h, t-2h),
/// during = [t-2h, t+2h], post = (t+2h, t+6h]. The highest-priority phase
/// among active events wins (during > pre > post).
pub fn evaluate_event_risk(events: &[EconomicEvent], now: DateTime<Utc>) -> EventRiskState {
    let mut best: Option<(EventPhase, DateTime<Utc>, &EconomicEvent)> = None;

    for event in events {
        let Some(t) = event.occurs_at() else {
            warn!(event = %event.id, date = %event.date, "unparseable event datetime");
            continue;
        };

        let (phase, expires_at) = if now >= t - Duration::hours(2) && now <= t + Duration::hours(2)
        {
            (EventPhase::During, t + Duration::hours(2))
        } else if now >= t - Duration::hours(24) && now < t - Duration::hours(2) {
            (EventPhase::Pre, t - Duration::hours(2))
        } else if now > t + Duration::hours(2) && now <= t + Duration::hours(6) {
            (EventPhase::Post, t + Duration::hours(6))
        } else {
            continue;
        };

        let replace = match &best {
            Some((current, _, _)) => phase > *current,
            None => true,
        };
        if replace {
            best = Some((phase, expires_at, event));
        }
    }

    match best {
        Some((phase, expires_at, event)) => EventRiskState {
            phase,
            position_ratio_multiplier: phase.position_ratio_multiplier(),
            expires_at: Some(expires_at),
            event_name: Some(event.name.clone()),
        },
        None => EventRiskState::inactive(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, date: &str, time: &str) -> EconomicEvent {
        EconomicEvent {
            id: id.to_string(),
            name: format!("event {id}"),
            date: date.to_string(),
            time: time.to_string(),
            impact: "high".to_string(),
            category: "cpi".to_string(),
        }
    }

    fn at(date: &str, time: &str) -> DateTime<Utc> {
        format!("{date}T{time}:00Z").parse().unwrap()
    }

    #[test]
    fn phases_and_multipliers() {
        let events = vec![event("cpi", "2024-03-12", "12:30")];

        let pre = evaluate_event_risk(&events, at("2024-03-12", "08:00"));
        assert_eq!(pre.phase, EventPhase::Pre);
        assert_eq!(pre.position_ratio_multiplier, dec!(0.5));
        assert_eq!(pre.expires_at, Some(at("2024-03-12", "10:30")));

        let during = evaluate_event_risk(&events, at("2024-03-12", "12:00"));
        assert_eq!(during.phase, EventPhase::During);
        assert_eq!(during.position_ratio_multiplier, Decimal::ZERO);

        let post = evaluate_event_risk(&events, at("2024-03-12", "15:00"));
        assert_eq!(post.phase, EventPhase::Post);
        assert_eq!(post.position_ratio_multiplier, dec!(0.7));

        let clear = evaluate_event_risk(&events, at("2024-03-13", "00:00"));
        assert_eq!(clear.phase, EventPhase::None);
        assert_eq!(clear.position_ratio_multiplier, Decimal::ONE);
    }

    #[test]
    fn during_beats_pre_across_events() {
        let events = vec![
            event("tomorrow", "2024-03-13", "10:00"), // pre window at eval time
            event("now", "2024-03-12", "12:30"),      // during window
        ];
        let state = evaluate_event_risk(&events, at("2024-03-12", "12:00"));
        assert_eq!(state.phase, EventPhase::During);
        assert_eq!(state.event_name.as_deref(), Some("event now"));
    }

    #[test]
    fn window_boundaries_are_inclusive() {
        let events = vec![event("cpi", "2024-03-12", "12:30")];
        // exactly t-2h belongs to during
        let state = evaluate_event_risk(&events, at("2024-03-12", "10:30"));
        assert_eq!(state.phase, EventPhase::During);
        // exactly t+6h is still post
        let state = evaluate_event_risk(&events, at("2024-03-12", "18:30"));
        assert_eq!(state.phase, EventPhase::Post);
        // t-24h starts pre
        let state = evaluate_event_risk(&events, at("2024-03-11", "12:30"));
        assert_eq!(state.phase, EventPhase::Pre);
    }

    #[test]
    fn missing_time_defaults_to_midnight() {
        let json = r#"{"id":"x","name":"X","date":"2024-03-12","impact":"low","category":"misc"}"#;
        let event: EconomicEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.occurs_at(), Some(at("2024-03-12", "00:00")));
    }
}

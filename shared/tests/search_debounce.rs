mod common;

use common::{bearer, first_http, login_as, position, requests, take_timers, timer_ops, url, Client};
use crux_core::Request;
use crux_http::protocol::HttpRequest;
use proptest::prelude::*;
use ride_core::capabilities::TimerOperation;
use ride_core::search::SearchField;
use ride_core::{Effect, Event};
use serde_json::json;
use url::Url;

fn searching_passenger() -> Client {
    let mut client = Client::new();
    login_as(&mut client, "PASSENGER");
    client.send(Event::PositionUpdated(position(-23.561, -46.656)));
    client.send(Event::OpenLocationSearch);
    client
}

fn started_timer(mut effects: Vec<Effect>) -> Option<Request<TimerOperation>> {
    take_timers(&mut effects).into_iter().find(|r| match r.operation {
        TimerOperation::Start {
            after_ms,
            repeat: false,
            ..
        } => {
            assert_eq!(after_ms, 500);
            true
        }
        _ => false,
    })
}

/// Type `query` and let the debounce run out; returns the lookup.
fn lookup(client: &mut Client, query: &str) -> Request<HttpRequest> {
    let mut timer = started_timer(client.send(Event::SearchQueryChanged(query.to_string())))
        .expect("debounce started");
    first_http(client.fire(&mut timer))
}

fn looked_up(effects: &[Effect]) -> Vec<String> {
    requests(effects)
        .iter()
        .map(|r| {
            let url = Url::parse(&r.url).unwrap();
            url.query_pairs()
                .find(|(k, _)| k == "q")
                .map(|(_, v)| v.into_owned())
                .unwrap()
        })
        .collect()
}

proptest! {
    #[test]
    fn short_queries_never_reach_the_geocoder(query in "[ \t]{0,3}[^\\s]{0,2}[ \t]{0,3}") {
        let mut c = searching_passenger();
        let effects = c.send(Event::SearchQueryChanged(query));
        prop_assert!(timer_ops(&effects).is_empty());
        prop_assert!(requests(&effects).is_empty());
    }

    #[test]
    fn only_the_last_query_of_a_burst_is_looked_up(burst in prop::collection::vec("[a-z]{3,10}", 1..6)) {
        let mut c = searching_passenger();
        let mut timers: Vec<Request<TimerOperation>> = Vec::new();
        for query in &burst {
            let effects = c.send(Event::SearchQueryChanged(query.clone()));
            if let Some(previous) = timers.last() {
                let cancel = TimerOperation::Cancel { id: previous.operation.id() };
                let cancelled = timer_ops(&effects).contains(&cancel);
                prop_assert!(cancelled);
            }
            timers.push(started_timer(effects).unwrap());
        }

        let mut last = timers.pop().unwrap();
        for mut stale in timers {
            let effects = c.fire(&mut stale);
            prop_assert!(requests(&effects).is_empty());
        }
        let effects = c.fire(&mut last);
        prop_assert_eq!(looked_up(&effects), vec![burst.last().unwrap().clone()]);
    }
}

#[test]
fn test_lookup_url_shape() {
    let mut c = searching_passenger();
    let request = lookup(&mut c, "  Av Paulista ");

    let parsed = Url::parse(url(&request)).unwrap();
    assert_eq!(parsed.host_str(), Some("nominatim.openstreetmap.org"));
    let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
    assert_eq!(
        pairs,
        vec![
            ("q".to_string(), "Av Paulista".to_string()),
            ("format".to_string(), "json".to_string()),
            ("limit".to_string(), "5".to_string()),
        ]
    );
    assert!(bearer(&request).is_none());
}

#[test]
fn test_out_of_order_results_keep_the_latest() {
    let mut c = searching_passenger();
    let mut first = lookup(&mut c, "Paulista");
    let mut second = lookup(&mut c, "Pinheiros");

    c.respond(
        &mut second,
        200,
        json!([{"display_name": "Pinheiros, São Paulo", "lat": "-23.567", "lon": "-46.693"}]),
    );
    c.respond(
        &mut first,
        200,
        json!([{"display_name": "Avenida Paulista, São Paulo", "lat": "-23.561", "lon": "-46.656"}]),
    );

    let search = c.model.passenger.selection().search();
    assert_eq!(search.results().len(), 1);
    assert_eq!(search.results()[0].name, "Pinheiros");
    assert!(!search.is_loading());
}

#[test]
fn test_shortening_the_query_drops_pending_results() {
    let mut c = searching_passenger();
    let mut pending = lookup(&mut c, "Paulista");

    c.send(Event::SearchQueryChanged("Pa".to_string()));
    c.respond(
        &mut pending,
        200,
        json!([{"display_name": "Avenida Paulista", "lat": "-23.561", "lon": "-46.656"}]),
    );

    assert!(c.model.passenger.selection().search().results().is_empty());
}

#[test]
fn test_choosing_a_result_fills_the_active_field() {
    let mut c = searching_passenger();
    let mut pending = lookup(&mut c, "Praça da Sé");
    c.respond(
        &mut pending,
        200,
        json!([{"name": "Praça da Sé", "display_name": "Praça da Sé, São Paulo", "lat": -23.55, "lon": -46.63}]),
    );

    c.send(Event::SearchResultChosen(0));
    let selection = c.model.passenger.selection();
    assert_eq!(selection.search().active_field(), SearchField::Destination);
    assert_eq!(
        selection.destination().map(|d| d.name.as_str()),
        Some("Praça da Sé")
    );
    assert_eq!(
        selection.pickup().map(|p| p.name.as_str()),
        Some("Current location")
    );

    let preview = first_http(c.send(Event::LocationsConfirmed));
    assert!(url(&preview).ends_with("/trip-preview"));
}

#[test]
fn test_geocoder_failure_is_shown_in_the_sheet() {
    let mut c = searching_passenger();
    let mut pending = lookup(&mut c, "Paulista");
    c.respond(&mut pending, 503, json!({}));

    let search = c.model.passenger.selection().search();
    assert!(search.results().is_empty());
    assert!(search.error().is_some());
}

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use ulid::Ulid;

use super::*;
use crate::blob::{Attachment, FsBlobStore};
use crate::draft::{ClassDraft, RentalDraft};
use crate::model::*;
use crate::recurrence::{to_instant, to_local};

const TARIFF: Tariff = Tariff {
    off_peak: 10_000,
    peak: 15_000,
    weekend: 20_000,
};

fn test_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("salas_test_engine").join(name);
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn open(dir: &PathBuf, calendar: Calendar) -> Engine {
    let blobs = Arc::new(FsBlobStore::new(dir.join("blobs")).unwrap());
    Engine::new(dir.join("salas.wal"), calendar, blobs).unwrap()
}

/// Fresh engine with one venue and one room priced with `TARIFF`.
async fn setup(name: &str) -> (Engine, Ulid, PathBuf) {
    let dir = test_dir(name);
    let engine = open(&dir, Calendar::default());
    let venue_id = Ulid::new();
    engine.create_venue(venue_id, "Piso 2".into()).await.unwrap();
    let room_id = Ulid::new();
    engine
        .create_room(Room {
            id: room_id,
            venue_id,
            name: "Sala A".into(),
            tariff: TARIFF,
        })
        .await
        .unwrap();
    (engine, room_id, dir)
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn time(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn class_draft(room_id: Ulid, on: NaiveDate, start: NaiveTime, minutes: u32, name: &str) -> ClassDraft {
    ClassDraft {
        room_id: Some(room_id),
        teacher_id: Some(Ulid::new()),
        date: Some(on),
        start,
        duration_minutes: minutes,
        name: name.into(),
        ..ClassDraft::default()
    }
}

fn rental_draft(
    room_id: Ulid,
    on: NaiveDate,
    start: NaiveTime,
    minutes: u32,
    client: &str,
    state: RentalState,
) -> RentalDraft {
    RentalDraft {
        room_id: Some(room_id),
        date: Some(on),
        start,
        duration_minutes: minutes,
        client: Client {
            name: client.into(),
            ..Client::default()
        },
        state,
        ..RentalDraft::default()
    }
}

fn local_span(engine: &Engine, from: NaiveDateTime, to: NaiveDateTime) -> Span {
    let tz = engine.calendar().tz;
    Span::new(to_instant(&tz, from), to_instant(&tz, to))
}

fn whole_year(engine: &Engine, year: i32) -> Span {
    local_span(
        engine,
        date(year, 1, 1).and_time(NaiveTime::MIN),
        date(year + 1, 1, 1).and_time(NaiveTime::MIN),
    )
}

fn rental_of(booking: Option<Booking>) -> RentalOccurrence {
    match booking {
        Some(Booking::Rental(r)) => r,
        other => panic!("expected rental, got {other:?}"),
    }
}

// ── Rate resolution ──────────────────────────────────────

#[tokio::test]
async fn weekday_peak_and_weekend_rates() {
    let (engine, room_id, _) = setup("rates").await;

    // Tuesday 19:00 is inside the 18-22 band.
    let tuesday = date(2024, 6, 4);
    let rate = engine
        .resolve_rate(room_id, tuesday, time(19, 0), UsageCategory::Rehearsal)
        .await
        .unwrap();
    assert_eq!(rate, 15_000);

    // Saturday 10:00: weekend wins over the off-peak hour.
    let saturday = date(2024, 6, 8);
    let rate = engine
        .resolve_rate(room_id, saturday, time(10, 0), UsageCategory::Rehearsal)
        .await
        .unwrap();
    assert_eq!(rate, 20_000);

    let production = engine
        .resolve_rate(room_id, tuesday, time(19, 0), UsageCategory::Production)
        .await
        .unwrap();
    assert_eq!(production, 22_500);
}

#[tokio::test]
async fn unknown_room_has_no_rate() {
    let (engine, _, _) = setup("rate_unknown_room").await;
    let missing = Ulid::new();
    let err = engine
        .resolve_rate(missing, date(2024, 6, 4), time(10, 0), UsageCategory::Event)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(id) if id == missing));
}

#[tokio::test]
async fn tariff_update_changes_future_quotes_only() {
    let (engine, room_id, _) = setup("tariff_update").await;
    let draft = rental_draft(room_id, date(2024, 6, 4), time(10, 0), 60, "Ana", RentalState::Confirmed);
    let booked = engine.schedule_rentals(&draft).await.unwrap();

    engine
        .update_tariff(room_id, Tariff { off_peak: 12_000, ..TARIFF })
        .await
        .unwrap();
    assert_eq!(engine.quote_rental(&draft).await.unwrap().total, 12_000);

    let stored = rental_of(engine.get_booking(booked.ids[0]).await);
    assert_eq!(stored.price, 10_000);

    let err = engine
        .update_tariff(room_id, Tariff { peak: -1, ..TARIFF })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(ValidationError::NegativePrice)));
}

// ── Recurrence through the writer ────────────────────────

#[tokio::test]
async fn weekly_class_runs_to_year_end() {
    let (engine, room_id, _) = setup("weekly_class").await;
    let mut draft = class_draft(room_id, date(2025, 3, 3), time(10, 0), 60, "Ballet");
    draft.repeat_weekly = true;

    let outcome = engine.schedule_classes(&draft).await.unwrap();
    assert_eq!(outcome.created, 44);
    let group = outcome.group.expect("weekly classes share a group");

    let series = engine.series(group).await.unwrap();
    assert_eq!(series.len(), 44);
    let tz = engine.calendar().tz;
    let starts: Vec<NaiveDateTime> = series.iter().map(|b| to_local(&tz, b.span().start)).collect();
    assert_eq!(starts[0], date(2025, 3, 3).and_time(time(10, 0)));
    assert_eq!(starts[1], date(2025, 3, 10).and_time(time(10, 0)));
    assert_eq!(starts[43], date(2025, 12, 29).and_time(time(10, 0)));
    assert!(starts.iter().all(|s| s.time() == time(10, 0)));
    assert!(series.iter().all(|b| b.group() == Some(group)));
}

#[tokio::test]
async fn single_class_has_no_group() {
    let (engine, room_id, _) = setup("single_class").await;
    let draft = class_draft(room_id, date(2024, 6, 3), time(9, 0), 90, "Yoga");
    let outcome = engine.schedule_classes(&draft).await.unwrap();
    assert_eq!(outcome.created, 1);
    assert_eq!(outcome.group, None);
    assert!(outcome.quote.is_none());
}

#[tokio::test]
async fn weekly_class_keeps_wall_clock_across_dst() {
    let dir = test_dir("weekly_dst");
    let calendar = Calendar {
        tz: chrono_tz::America::New_York,
        ..Calendar::default()
    };
    let engine = open(&dir, calendar);
    let venue_id = Ulid::new();
    engine.create_venue(venue_id, "Studio".into()).await.unwrap();
    let room_id = Ulid::new();
    engine
        .create_room(Room { id: room_id, venue_id, name: "Main".into(), tariff: TARIFF })
        .await
        .unwrap();

    let mut draft = class_draft(room_id, date(2024, 3, 4), time(10, 0), 60, "Jazz");
    draft.repeat_weekly = true;
    let outcome = engine.schedule_classes(&draft).await.unwrap();
    let series = engine.series(outcome.group.unwrap()).await.unwrap();

    let tz = engine.calendar().tz;
    // Clocks jump forward on 2024-03-10; the class stays at 10:00 local.
    assert_eq!(to_local(&tz, series[1].span().start), date(2024, 3, 11).and_time(time(10, 0)));
    assert_eq!(series[1].span().start - series[0].span().start, 167 * 3_600_000);
}

// ── Conflict scenarios ───────────────────────────────────

#[tokio::test]
async fn class_overlapping_confirmed_rental_is_rejected() {
    let (engine, room_id, _) = setup("conflict_rental").await;
    let day = date(2024, 6, 1);
    engine
        .schedule_rentals(&rental_draft(room_id, day, time(18, 0), 120, "Ana", RentalState::Confirmed))
        .await
        .unwrap();

    let err = engine
        .schedule_classes(&class_draft(room_id, day, time(19, 0), 90, "Salsa"))
        .await
        .unwrap_err();
    let EngineError::Conflict(conflict) = &err else {
        panic!("expected conflict, got {err:?}");
    };
    assert_eq!(conflict.date, day);
    assert_eq!(conflict.existing.kind, BookingKind::Rental);
    assert_eq!(conflict.existing.label, "Ana");
    assert_eq!(err.user_message(), "Conflicto el 01/06: Alquiler existente: Ana");
}

#[tokio::test]
async fn touching_the_end_of_a_rental_is_free() {
    let (engine, room_id, _) = setup("conflict_touch").await;
    let day = date(2024, 6, 1);
    engine
        .schedule_rentals(&rental_draft(room_id, day, time(18, 0), 120, "Ana", RentalState::Confirmed))
        .await
        .unwrap();

    let outcome = engine
        .schedule_classes(&class_draft(room_id, day, time(20, 0), 60, "Salsa"))
        .await
        .unwrap();
    assert_eq!(outcome.created, 1);

    let before = local_span(&engine, day.and_time(time(17, 0)), day.and_time(time(18, 0)));
    assert!(engine.has_conflict(room_id, before).await.unwrap().is_none());
}

#[tokio::test]
async fn quoted_rental_does_not_block() {
    let (engine, room_id, _) = setup("conflict_quoted").await;
    let day = date(2024, 6, 1);
    engine
        .schedule_rentals(&rental_draft(room_id, day, time(18, 0), 120, "Ana", RentalState::Quoted))
        .await
        .unwrap();

    let span = local_span(&engine, day.and_time(time(18, 0)), day.and_time(time(20, 0)));
    assert!(engine.has_conflict(room_id, span).await.unwrap().is_none());
    engine
        .schedule_classes(&class_draft(room_id, day, time(18, 0), 120, "Tango"))
        .await
        .unwrap();
}

#[tokio::test]
async fn classes_are_reported_before_rentals() {
    let (engine, room_id, _) = setup("conflict_order").await;
    let day = date(2024, 6, 3);
    engine
        .schedule_rentals(&rental_draft(room_id, day, time(17, 0), 60, "Ana", RentalState::Paid))
        .await
        .unwrap();
    engine
        .schedule_classes(&class_draft(room_id, day, time(18, 0), 60, "Salsa"))
        .await
        .unwrap();

    let span = local_span(&engine, day.and_time(time(17, 0)), day.and_time(time(19, 0)));
    let hit = engine.has_conflict(room_id, span).await.unwrap().unwrap();
    assert_eq!(hit.kind, BookingKind::Class);
    assert_eq!(hit.label, "Salsa");
}

#[tokio::test]
async fn rooms_do_not_see_each_other() {
    let (engine, room_id, _) = setup("conflict_rooms").await;
    let venue_id = engine.room(room_id).await.unwrap().venue_id;
    let other = Ulid::new();
    engine
        .create_room(Room { id: other, venue_id, name: "Sala B".into(), tariff: TARIFF })
        .await
        .unwrap();

    let day = date(2024, 6, 3);
    engine
        .schedule_classes(&class_draft(room_id, day, time(18, 0), 60, "Salsa"))
        .await
        .unwrap();
    engine
        .schedule_classes(&class_draft(other, day, time(18, 0), 60, "Tango"))
        .await
        .unwrap();
}

// ── Batch atomicity ──────────────────────────────────────

#[tokio::test]
async fn one_conflicting_date_rejects_the_whole_series() {
    let (engine, room_id, _) = setup("atomic_series").await;
    // A Monday in June, at the same hour as the weekly class below.
    let blocker = engine
        .schedule_rentals(&rental_draft(room_id, date(2025, 6, 2), time(10, 0), 60, "Ana", RentalState::Confirmed))
        .await
        .unwrap();
    let appends = engine.wal_appends_since_compact().await;

    let mut draft = class_draft(room_id, date(2025, 3, 3), time(10, 0), 60, "Ballet");
    draft.repeat_weekly = true;
    let err = engine.schedule_classes(&draft).await.unwrap_err();
    match err {
        EngineError::Conflict(c) => {
            assert_eq!(c.date, date(2025, 6, 2));
            assert_eq!(c.existing.booking_id, blocker.ids[0]);
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    assert_eq!(engine.wal_appends_since_compact().await, appends);
    let year = whole_year(&engine, 2025);
    assert_eq!(engine.room_bookings(room_id, year).await.unwrap().len(), 1);
}

#[tokio::test]
async fn validation_fails_before_storage() {
    let (engine, room_id, _) = setup("validation").await;
    let appends = engine.wal_appends_since_compact().await;

    let nameless = rental_draft(room_id, date(2024, 6, 4), time(10, 0), 60, " ", RentalState::Quoted);
    let err = engine.schedule_rentals(&nameless).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(ValidationError::MissingClient)));
    assert_eq!(err.user_message(), "Falta el nombre del cliente");

    let mut no_teacher = class_draft(room_id, date(2024, 6, 4), time(10, 0), 60, "Salsa");
    no_teacher.teacher_id = None;
    assert!(matches!(
        engine.schedule_classes(&no_teacher).await,
        Err(EngineError::Validation(ValidationError::MissingTeacher))
    ));

    let unknown_room = rental_draft(Ulid::new(), date(2024, 6, 4), time(10, 0), 60, "Ana", RentalState::Quoted);
    assert!(matches!(engine.schedule_rentals(&unknown_room).await, Err(EngineError::NotFound(_))));

    assert_eq!(engine.wal_appends_since_compact().await, appends);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_bookings_of_one_slot_admit_one() {
    let (engine, room_id, _) = setup("concurrent").await;
    let engine = Arc::new(engine);
    let day = date(2024, 6, 4);

    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = engine.clone();
        let draft = rental_draft(room_id, day, time(19, 0), 60, &format!("Banda {i}"), RentalState::Confirmed);
        handles.push(tokio::spawn(async move { engine.schedule_rentals(&draft).await }));
    }
    let mut admitted = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(EngineError::Conflict(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(admitted, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_renewal_commits_admit_one() {
    let (engine, room_id, _) = setup("concurrent_renewal").await;
    let july = YearMonth::new(2024, 7).unwrap();
    let source = book_monthly(&engine, room_id, july, date(2024, 7, 3), RentalState::Confirmed).await;
    let projection = engine.project_renewals(july.next()).await.remove(0);
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        let projection = projection.clone();
        handles.push(tokio::spawn(async move { engine.commit_renewal(&projection).await }));
    }
    let mut admitted = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(EngineError::AlreadyExists(g)) => assert_eq!(Some(g), source.group),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(admitted, 1);
    let renewals = engine
        .rentals(None)
        .await
        .into_iter()
        .filter(|r| r.renewed_from == source.group)
        .count();
    assert_eq!(renewals, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn compaction_racing_writes_keeps_every_acknowledged_booking() {
    let (engine, first_room, dir) = setup("compact_race").await;
    let venue_id = engine.room(first_room).await.unwrap().venue_id;
    let mut rooms = vec![first_room];
    for i in 1..8 {
        let id = Ulid::new();
        engine
            .create_room(Room { id, venue_id, name: format!("Sala {i}"), tariff: TARIFF })
            .await
            .unwrap();
        rooms.push(id);
    }
    let engine = Arc::new(engine);

    for round in 0..25u32 {
        let mut writes = Vec::new();
        let compaction = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.compact_wal().await })
        };
        for &room_id in &rooms {
            let engine = engine.clone();
            let draft = rental_draft(room_id, date(2024, 3, 1 + round), time(10, 0), 60, "Ana", RentalState::Quoted);
            writes.push(tokio::spawn(async move { engine.schedule_rentals(&draft).await }));
        }
        for w in writes {
            w.await.unwrap().unwrap();
        }
        compaction.await.unwrap().unwrap();

        let live = engine.rentals(None).await.len();
        let reopened = open(&dir, Calendar::default());
        assert_eq!(reopened.rentals(None).await.len(), live, "round {round}");
    }
}

// ── Quotes ───────────────────────────────────────────────

#[tokio::test]
async fn monthly_quote_and_booking_share_prices() {
    let (engine, room_id, _) = setup("monthly_quote").await;
    let mut draft = rental_draft(room_id, date(2024, 6, 5), time(20, 0), 120, "Ana", RentalState::Quoted);
    draft.monthly = Some(YearMonth::new(2024, 6).unwrap());

    let quote = engine.quote_rental(&draft).await.unwrap();
    assert_eq!(quote.unit_price, 15_000);
    assert_eq!(quote.occurrence_price, 30_000);
    assert_eq!(quote.total, 120_000);
    assert_eq!(quote.detail, "Mensual (4 días): 05/06, 12/06, 19/06, 26/06");

    let outcome = engine.schedule_rentals(&draft).await.unwrap();
    assert_eq!(outcome.created, 4);
    assert_eq!(outcome.quote.as_ref(), Some(&quote));
    for id in &outcome.ids {
        let r = rental_of(engine.get_booking(*id).await);
        assert_eq!(r.price, 30_000);
        assert_eq!(r.notes, quote.detail);
        assert_eq!(r.state, RentalState::Quoted);
        assert_eq!(r.group, outcome.group);
    }
}

#[tokio::test]
async fn quoting_writes_nothing() {
    let (engine, room_id, _) = setup("quote_pure").await;
    let appends = engine.wal_appends_since_compact().await;
    let draft = rental_draft(room_id, date(2024, 6, 8), time(11, 0), 90, "Ana", RentalState::Quoted);

    let first = engine.quote_rental(&draft).await.unwrap();
    let second = engine.quote_rental(&draft).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.detail, "Fecha única: 08/06");
    assert_eq!(first.total, 30_000);

    let message = engine.quote_message(&draft).await.unwrap();
    assert!(message.contains("*JUNIO*"));
    assert!(message.contains("$30.000"));

    assert_eq!(engine.wal_appends_since_compact().await, appends);
    assert!(engine.rentals(None).await.is_empty());
}

// ── Renewals ─────────────────────────────────────────────

async fn book_monthly(engine: &Engine, room_id: Ulid, month: YearMonth, first: NaiveDate, state: RentalState) -> BatchOutcome {
    let mut draft = rental_draft(room_id, first, time(20, 0), 120, "Ana", state);
    draft.monthly = Some(month);
    draft.headcount = 6;
    engine.schedule_rentals(&draft).await.unwrap()
}

#[tokio::test]
async fn renewal_projects_four_wednesdays() {
    let (engine, room_id, _) = setup("renewal_project").await;
    let july = YearMonth::new(2024, 7).unwrap();
    let source = book_monthly(&engine, room_id, july, date(2024, 7, 3), RentalState::Confirmed).await;

    let august = YearMonth::new(2024, 8).unwrap();
    let projections = engine.project_renewals(august).await;
    assert_eq!(projections.len(), 1);
    let p = &projections[0];
    assert_eq!(p.source_group, source.group.unwrap());
    assert_eq!(p.source_month, july);
    assert_eq!(
        p.dates(),
        &[date(2024, 8, 7), date(2024, 8, 14), date(2024, 8, 21), date(2024, 8, 28)]
    );
    assert_eq!(p.quote.unit_price, 15_000);
    assert_eq!(p.total(), 15_000 * 2 * 4);
    assert_eq!(p.start, time(20, 0));
    assert_eq!(p.headcount, 6);
    assert!(p.message().contains("*AGOSTO*"));
    assert!(p.message().contains("07/08, 14/08, 21/08, 28/08"));

    // Not before the source month, and nothing projected onto itself.
    assert!(engine.project_renewals(july).await.is_empty());
}

#[tokio::test]
async fn renewal_uses_current_tariff_at_first_new_date() {
    let (engine, room_id, _) = setup("renewal_rate").await;
    let july = YearMonth::new(2024, 7).unwrap();
    book_monthly(&engine, room_id, july, date(2024, 7, 3), RentalState::Paid).await;
    engine
        .update_tariff(room_id, Tariff { peak: 18_000, ..TARIFF })
        .await
        .unwrap();

    let projections = engine.project_renewals(YearMonth::new(2024, 8).unwrap()).await;
    assert_eq!(projections[0].quote.unit_price, 18_000);
    assert_eq!(projections[0].total(), 18_000 * 2 * 4);
}

#[tokio::test]
async fn committing_a_renewal_books_quoted_series_once() {
    let (engine, room_id, _) = setup("renewal_commit").await;
    let july = YearMonth::new(2024, 7).unwrap();
    let source = book_monthly(&engine, room_id, july, date(2024, 7, 3), RentalState::Confirmed).await;
    let august = YearMonth::new(2024, 8).unwrap();

    let projection = engine.project_renewals(august).await.remove(0);
    let renewed = engine.commit_renewal(&projection).await.unwrap();
    assert_eq!(renewed.created, 4);

    let series = engine.series(renewed.group.unwrap()).await.unwrap();
    for booking in series {
        let Booking::Rental(r) = booking else { panic!("class in a rental series") };
        assert_eq!(r.state, RentalState::Quoted);
        assert_eq!(r.renewed_from, source.group);
        assert_eq!(r.monthly, Some(august));
        assert_eq!(r.notes, "Renovación automática. Días: 07/08, 14/08, 21/08, 28/08");
    }

    assert!(engine.project_renewals(august).await.is_empty());
    assert!(matches!(
        engine.commit_renewal(&projection).await,
        Err(EngineError::AlreadyExists(g)) if Some(g) == source.group
    ));

    // The renewal is itself renewable the month after.
    let september = engine.project_renewals(YearMonth::new(2024, 9).unwrap()).await;
    assert_eq!(september.len(), 1);
    assert_eq!(september[0].source_group, renewed.group.unwrap());
}

#[tokio::test]
async fn cancelled_series_are_not_renewed() {
    let (engine, room_id, _) = setup("renewal_cancelled").await;
    let july = YearMonth::new(2024, 7).unwrap();
    let source = book_monthly(&engine, room_id, july, date(2024, 7, 3), RentalState::Quoted).await;
    engine
        .set_rental_series_state(source.group.unwrap(), RentalState::Cancelled)
        .await
        .unwrap();
    assert!(engine.project_renewals(YearMonth::new(2024, 8).unwrap()).await.is_empty());
}

#[tokio::test]
async fn renewal_commit_checks_conflicts() {
    let (engine, room_id, _) = setup("renewal_conflict").await;
    let july = YearMonth::new(2024, 7).unwrap();
    book_monthly(&engine, room_id, july, date(2024, 7, 3), RentalState::Confirmed).await;
    engine
        .schedule_classes(&class_draft(room_id, date(2024, 8, 21), time(21, 0), 60, "Tango"))
        .await
        .unwrap();

    let projection = engine.project_renewals(YearMonth::new(2024, 8).unwrap()).await.remove(0);
    let err = engine.commit_renewal(&projection).await.unwrap_err();
    assert_eq!(err.user_message(), "Conflicto el 21/08: Clase existente: Tango");
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn confirming_a_quote_rechecks_the_room() {
    let (engine, room_id, _) = setup("confirm_recheck").await;
    let day = date(2024, 6, 4);
    let quoted = engine
        .schedule_rentals(&rental_draft(room_id, day, time(19, 0), 60, "Ana", RentalState::Quoted))
        .await
        .unwrap();
    let id = quoted.ids[0];

    // Someone books the slot for real while Ana thinks about it.
    engine
        .schedule_rentals(&rental_draft(room_id, day, time(19, 30), 60, "Beto", RentalState::Confirmed))
        .await
        .unwrap();

    let err = engine.set_rental_state(id, RentalState::Confirmed).await.unwrap_err();
    assert!(matches!(&err, EngineError::Conflict(c) if c.existing.label == "Beto"));
    assert_eq!(rental_of(engine.get_booking(id).await).state, RentalState::Quoted);

    engine.set_rental_state(id, RentalState::Cancelled).await.unwrap();
    let err = engine.set_rental_state(id, RentalState::Confirmed).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition { from: RentalState::Cancelled, to: RentalState::Confirmed, .. }
    ));
}

#[tokio::test]
async fn rental_lifecycle_to_paid() {
    let (engine, room_id, _) = setup("lifecycle_paid").await;
    let outcome = engine
        .schedule_rentals(&rental_draft(room_id, date(2024, 6, 4), time(10, 0), 60, "Ana", RentalState::Quoted))
        .await
        .unwrap();
    let id = outcome.ids[0];
    engine.set_rental_state(id, RentalState::Confirmed).await.unwrap();
    engine.set_rental_state(id, RentalState::Paid).await.unwrap();
    assert_eq!(rental_of(engine.get_booking(id).await).state, RentalState::Paid);
    assert!(matches!(
        engine.set_rental_state(id, RentalState::Quoted).await,
        Err(EngineError::InvalidTransition { .. })
    ));

    let class = engine
        .schedule_classes(&class_draft(room_id, date(2024, 6, 5), time(10, 0), 60, "Salsa"))
        .await
        .unwrap();
    assert!(matches!(
        engine.set_rental_state(class.ids[0], RentalState::Paid).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn series_state_change_is_all_or_nothing() {
    let (engine, room_id, _) = setup("series_state").await;
    let june = YearMonth::new(2024, 6).unwrap();
    let series = book_monthly(&engine, room_id, june, date(2024, 6, 5), RentalState::Quoted).await;
    let group = series.group.unwrap();

    // Blocks the third Wednesday only.
    engine
        .schedule_classes(&class_draft(room_id, date(2024, 6, 19), time(20, 30), 60, "Salsa"))
        .await
        .unwrap();
    let err = engine.set_rental_series_state(group, RentalState::Confirmed).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(c) if c.date == date(2024, 6, 19)));
    assert!(engine.rentals(Some(RentalState::Confirmed)).await.is_empty());

    // Drop the Wednesday that clashes, then the rest confirm together.
    engine.set_rental_state(series.ids[2], RentalState::Cancelled).await.unwrap();
    let moved = engine.set_rental_series_state(group, RentalState::Confirmed).await.unwrap();
    assert_eq!(moved, 3);
    assert_eq!(engine.rentals(Some(RentalState::Confirmed)).await.len(), 3);
    assert_eq!(engine.rentals(Some(RentalState::Cancelled)).await.len(), 1);
}

#[tokio::test]
async fn cancelled_class_frees_its_slot() {
    let (engine, room_id, _) = setup("cancel_class").await;
    let day = date(2024, 6, 4);
    let class = engine
        .schedule_classes(&class_draft(room_id, day, time(18, 0), 60, "Salsa"))
        .await
        .unwrap();
    let id = class.ids[0];

    engine.cancel_class(id).await.unwrap();
    engine.cancel_class(id).await.unwrap();
    engine
        .schedule_rentals(&rental_draft(room_id, day, time(18, 0), 60, "Ana", RentalState::Confirmed))
        .await
        .unwrap();
}

#[tokio::test]
async fn delete_one_or_the_whole_series() {
    let (engine, room_id, _) = setup("delete_series").await;
    let mut draft = class_draft(room_id, date(2024, 11, 4), time(10, 0), 60, "Ballet");
    draft.repeat_weekly = true;
    let outcome = engine.schedule_classes(&draft).await.unwrap();
    assert_eq!(outcome.created, 9);
    let group = outcome.group.unwrap();

    assert_eq!(engine.delete_booking(outcome.ids[0]).await.unwrap(), room_id);
    assert!(engine.get_booking(outcome.ids[0]).await.is_none());
    assert_eq!(engine.delete_series(group).await.unwrap(), 8);
    assert!(matches!(engine.series(group).await, Err(EngineError::NotFound(_))));
    assert!(engine.get_booking(outcome.ids[5]).await.is_none());
    assert!(matches!(engine.delete_series(group).await, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn rooms_with_bookings_cannot_be_deleted() {
    let (engine, room_id, _) = setup("delete_room").await;
    let outcome = engine
        .schedule_classes(&class_draft(room_id, date(2024, 6, 4), time(10, 0), 60, "Salsa"))
        .await
        .unwrap();
    assert!(matches!(engine.delete_room(room_id).await, Err(EngineError::HasBookings(_))));

    engine.delete_booking(outcome.ids[0]).await.unwrap();
    engine.delete_room(room_id).await.unwrap();
    assert!(engine.list_rooms().await.is_empty());
    assert!(engine.room(room_id).await.is_none());
}

#[tokio::test]
async fn rooms_need_a_known_venue() {
    let (engine, room_id, _) = setup("room_venue").await;
    let orphan = Room {
        id: Ulid::new(),
        venue_id: Ulid::new(),
        name: "Sala X".into(),
        tariff: TARIFF,
    };
    assert!(matches!(engine.create_room(orphan).await, Err(EngineError::NotFound(_))));

    let venue_id = engine.room(room_id).await.unwrap().venue_id;
    let dup = Room { id: room_id, venue_id, name: "Sala A".into(), tariff: TARIFF };
    assert!(matches!(engine.create_room(dup).await, Err(EngineError::AlreadyExists(_))));
    assert_eq!(engine.rooms_of_venue(venue_id).await.unwrap().len(), 1);
}

// ── Attachments ──────────────────────────────────────────

#[tokio::test]
async fn flyer_is_uploaded_once_for_the_series() {
    let (engine, room_id, dir) = setup("flyer").await;
    let mut draft = class_draft(room_id, date(2024, 12, 2), time(10, 0), 60, "Ballet");
    draft.repeat_weekly = true;
    draft.image = Some(Attachment {
        file_name: "flyer.png".into(),
        bytes: vec![0x89, b'P', b'N', b'G'],
    });
    let outcome = engine.schedule_classes(&draft).await.unwrap();

    let images: Vec<Option<String>> = engine
        .series(outcome.group.unwrap())
        .await
        .unwrap()
        .into_iter()
        .map(|b| match b {
            Booking::Class(c) => c.image,
            Booking::Rental(_) => None,
        })
        .collect();
    let first = images[0].clone().expect("image reference");
    assert!(images.iter().all(|i| i.as_deref() == Some(first.as_str())));
    assert!(dir.join("blobs").join(&first).exists());
    assert_eq!(std::fs::read_dir(dir.join("blobs")).unwrap().count(), 1);
}

#[tokio::test]
async fn rejected_batch_uploads_nothing() {
    let (engine, room_id, dir) = setup("receipt_rejected").await;
    let day = date(2024, 6, 4);
    engine
        .schedule_classes(&class_draft(room_id, day, time(10, 0), 60, "Salsa"))
        .await
        .unwrap();
    let mut draft = rental_draft(room_id, day, time(10, 0), 60, "Ana", RentalState::Paid);
    draft.receipt = Some(Attachment {
        file_name: "recibo.pdf".into(),
        bytes: vec![1, 2, 3],
    });
    assert!(engine.schedule_rentals(&draft).await.is_err());
    assert_eq!(std::fs::read_dir(dir.join("blobs")).unwrap().count(), 0);
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn agenda_merges_live_bookings_in_start_order() {
    let (engine, room_id, _) = setup("agenda").await;
    let day = date(2024, 6, 4);
    engine
        .schedule_rentals(&rental_draft(room_id, day, time(20, 0), 60, "Ana", RentalState::Confirmed))
        .await
        .unwrap();
    engine
        .schedule_rentals(&rental_draft(room_id, day, time(12, 0), 60, "Beto", RentalState::Quoted))
        .await
        .unwrap();
    let mut special = class_draft(room_id, day, time(9, 0), 60, "Seminario");
    special.kind = ClassKind::Special;
    engine.schedule_classes(&special).await.unwrap();
    let gone = engine
        .schedule_classes(&class_draft(room_id, day, time(15, 0), 60, "Tango"))
        .await
        .unwrap();
    engine.cancel_class(gone.ids[0]).await.unwrap();

    let window = local_span(&engine, day.and_time(NaiveTime::MIN), date(2024, 6, 5).and_time(NaiveTime::MIN));
    let agenda = engine.agenda(window).await.unwrap();
    let titles: Vec<&str> = agenda.iter().map(|e| e.title.as_str()).collect();
    assert_eq!(titles, vec!["Seminario", "Ana"]);
    assert_eq!(agenda[0].kind, AgendaKind::Class(ClassKind::Special));
    assert_eq!(agenda[1].kind, AgendaKind::Rental(UsageCategory::Rehearsal));
    assert_eq!(agenda[1].room_name, "Sala A");
    assert_eq!(agenda[1].venue_name.as_deref(), Some("Piso 2"));
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn state_survives_restart() {
    let (engine, room_id, dir) = setup("restart").await;
    let june = YearMonth::new(2024, 6).unwrap();
    let series = book_monthly(&engine, room_id, june, date(2024, 6, 5), RentalState::Quoted).await;
    engine
        .set_rental_series_state(series.group.unwrap(), RentalState::Confirmed)
        .await
        .unwrap();
    let class = engine
        .schedule_classes(&class_draft(room_id, date(2024, 6, 3), time(10, 0), 60, "Salsa"))
        .await
        .unwrap();
    engine.cancel_class(class.ids[0]).await.unwrap();
    engine
        .update_tariff(room_id, Tariff { weekend: 25_000, ..TARIFF })
        .await
        .unwrap();
    drop(engine);

    let engine = open(&dir, Calendar::default());
    assert_eq!(engine.list_venues().len(), 1);
    assert_eq!(engine.room(room_id).await.unwrap().tariff.weekend, 25_000);
    assert_eq!(engine.series(series.group.unwrap()).await.unwrap().len(), 4);
    assert_eq!(engine.rentals(Some(RentalState::Confirmed)).await.len(), 4);
    match engine.get_booking(class.ids[0]).await {
        Some(Booking::Class(c)) => assert_eq!(c.state, ClassState::Cancelled),
        other => panic!("expected class, got {other:?}"),
    }
    // Indexes are rebuilt too.
    assert_eq!(engine.delete_series(series.group.unwrap()).await.unwrap(), 4);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let (engine, room_id, dir) = setup("compact").await;
    let outcome = engine
        .schedule_rentals(&rental_draft(room_id, date(2024, 6, 4), time(10, 0), 60, "Ana", RentalState::Quoted))
        .await
        .unwrap();
    let id = outcome.ids[0];
    engine.set_rental_state(id, RentalState::Confirmed).await.unwrap();
    engine.set_rental_state(id, RentalState::Paid).await.unwrap();
    for i in 0..5 {
        let class = engine
            .schedule_classes(&class_draft(room_id, date(2024, 6, 10 + i), time(10, 0), 60, "Salsa"))
            .await
            .unwrap();
        engine.delete_booking(class.ids[0]).await.unwrap();
    }

    let wal = dir.join("salas.wal");
    let size_before = std::fs::metadata(&wal).unwrap().len();
    engine.compact_wal().await.unwrap();
    let size_after = std::fs::metadata(&wal).unwrap().len();
    assert!(size_after < size_before, "compacted WAL ({size_after}) should be smaller than {size_before}");
    assert_eq!(engine.wal_appends_since_compact().await, 0);

    // Still writable after the swap.
    engine
        .schedule_classes(&class_draft(room_id, date(2024, 6, 20), time(10, 0), 60, "Yoga"))
        .await
        .unwrap();
    drop(engine);

    let engine = open(&dir, Calendar::default());
    assert_eq!(rental_of(engine.get_booking(id).await).state, RentalState::Paid);
    let june = local_span(&engine, date(2024, 6, 1).and_time(NaiveTime::MIN), date(2024, 7, 1).and_time(NaiveTime::MIN));
    assert_eq!(engine.room_bookings(room_id, june).await.unwrap().len(), 2);
}

use std::path::PathBuf;

use chrono::{NaiveDate, NaiveTime};
use rust_decimal::Decimal;

use super::*;
use crate::clock::FixedClock;

const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms
const DAY: Ms = 24 * H;

/// 2025-12-09T00:00:00Z
const DEC9: Ms = 1_765_238_400_000;
/// 2025-12-01T00:00:00Z, "now" for every test
const NOW: Ms = DEC9 - 8 * DAY;

const AYSE: TrainerId = 1; // works 09:00-18:00
const MEHMET: TrainerId = 2; // unrestricted
const YOGA: ServiceId = 1; // 60 min, 200
const PILATES: ServiceId = 2; // 45 min, 150
const ALI: MemberId = 1;
const VELI: MemberId = 2;

fn at(day: Ms, h: i64, m: i64) -> Ms {
    day + h * H + m * M
}

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("gymslot_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn open(path: PathBuf) -> Engine {
    Engine::with_clock(path, Arc::new(FixedClock::new(NOW))).unwrap()
}

async fn seed(engine: &Engine) {
    engine
        .put_trainer(AYSE, "Ayşe".into(), WorkingHours::new(hm(9, 0), hm(18, 0)))
        .await
        .unwrap();
    engine.put_trainer(MEHMET, "Mehmet".into(), None).await.unwrap();
    engine
        .put_service(YOGA, "Yoga".into(), 60, Decimal::from(200))
        .await
        .unwrap();
    engine
        .put_service(PILATES, "Pilates".into(), 45, Decimal::from(150))
        .await
        .unwrap();
    engine.put_member(ALI, "Ali".into(), "ali".into()).await.unwrap();
    engine.put_member(VELI, "Veli".into(), "veli".into()).await.unwrap();
}

async fn seeded(name: &str) -> Engine {
    let engine = open(test_wal_path(name));
    seed(&engine).await;
    engine
}

// ── Booking scenarios ────────────────────────────────────

#[tokio::test]
async fn book_unrestricted_trainer() {
    let engine = seeded("book_unrestricted.wal").await;
    let a = engine
        .create_appointment(ALI, MEHMET, YOGA, at(DEC9, 10, 0))
        .await
        .unwrap();
    assert_eq!(a.status, AppointmentStatus::Pending);
    assert_eq!(a.fee, Decimal::from(200));
    assert_eq!(a.span, Span::new(at(DEC9, 10, 0), at(DEC9, 11, 0)));
    assert_eq!(a.created_at, NOW);
    assert_eq!(a.member_id, ALI);
}

#[tokio::test]
async fn overlapping_booking_conflicts() {
    let engine = seeded("overlap_conflict.wal").await;
    let first = engine
        .create_appointment(ALI, MEHMET, YOGA, at(DEC9, 10, 0))
        .await
        .unwrap();
    let err = engine
        .create_appointment(VELI, MEHMET, YOGA, at(DEC9, 10, 30))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(id) if id == first.id));
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn back_to_back_bookings_allowed() {
    let engine = seeded("back_to_back.wal").await;
    engine
        .create_appointment(ALI, MEHMET, YOGA, at(DEC9, 10, 0))
        .await
        .unwrap();
    engine
        .create_appointment(VELI, MEHMET, YOGA, at(DEC9, 11, 0))
        .await
        .unwrap();
    // ends exactly where the first one starts
    engine
        .create_appointment(VELI, MEHMET, YOGA, at(DEC9, 9, 0))
        .await
        .unwrap();
}

#[tokio::test]
async fn outside_working_hours_rejected() {
    let engine = seeded("out_of_hours.wal").await;
    let err = engine
        .create_appointment(ALI, AYSE, YOGA, at(DEC9, 19, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::OutOfHours(_)));
    assert_eq!(err.kind(), ErrorKind::OutOfHours);

    // end past closing
    let err = engine
        .create_appointment(ALI, AYSE, YOGA, at(DEC9, 17, 30))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::OutOfHours(_)));

    // start before opening
    let err = engine
        .create_appointment(ALI, AYSE, PILATES, at(DEC9, 8, 30))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::OutOfHours(_)));
}

#[tokio::test]
async fn working_hours_edges_inclusive() {
    let engine = seeded("hours_edges.wal").await;
    engine
        .create_appointment(ALI, AYSE, YOGA, at(DEC9, 9, 0))
        .await
        .unwrap();
    engine
        .create_appointment(ALI, AYSE, YOGA, at(DEC9, 17, 0))
        .await
        .unwrap();
}

#[tokio::test]
async fn conflict_reported_before_working_hours() {
    let engine = seeded("conflict_first.wal").await;
    let first = engine
        .create_appointment(ALI, AYSE, YOGA, at(DEC9, 17, 0))
        .await
        .unwrap();
    // overlaps the 17:00 booking and also runs past 18:00
    let err = engine
        .create_appointment(VELI, AYSE, YOGA, at(DEC9, 17, 30))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(id) if id == first.id));
}

#[tokio::test]
async fn cancel_frees_slot() {
    let engine = seeded("cancel_frees.wal").await;
    let first = engine
        .create_appointment(ALI, MEHMET, YOGA, at(DEC9, 10, 0))
        .await
        .unwrap();
    let cancelled = engine.cancel_appointment(first.id).await.unwrap();
    assert_eq!(cancelled.status, AppointmentStatus::Cancelled);

    let again = engine
        .create_appointment(VELI, MEHMET, YOGA, at(DEC9, 10, 0))
        .await
        .unwrap();
    assert_ne!(again.id, first.id);
    assert_eq!(again.status, AppointmentStatus::Pending);
}

#[tokio::test]
async fn past_start_rejected_before_lookups() {
    let engine = seeded("past_start.wal").await;
    let yesterday = NOW - DAY;
    for (member, trainer, service) in [(ALI, MEHMET, YOGA), (99, 99, 99)] {
        let err = engine
            .create_appointment(member, trainer, service, yesterday)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }
}

#[tokio::test]
async fn start_exactly_now_allowed() {
    let engine = seeded("start_now.wal").await;
    engine
        .create_appointment(ALI, MEHMET, YOGA, NOW)
        .await
        .unwrap();
}

#[tokio::test]
async fn unknown_references_not_found() {
    let engine = seeded("unknown_refs.wal").await;
    let start = at(DEC9, 10, 0);
    let err = engine.create_appointment(99, MEHMET, YOGA, start).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(Entity::Member(99))));
    let err = engine.create_appointment(ALI, 99, YOGA, start).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(Entity::Trainer(99))));
    let err = engine.create_appointment(ALI, MEHMET, 99, start).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(Entity::Service(99))));
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn rejected_appointment_still_blocks() {
    let engine = seeded("rejected_blocks.wal").await;
    let a = engine
        .create_appointment(ALI, MEHMET, YOGA, at(DEC9, 10, 0))
        .await
        .unwrap();
    engine.reject_appointment(a.id).await.unwrap();
    let err = engine
        .create_appointment(VELI, MEHMET, YOGA, at(DEC9, 10, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(id) if id == a.id));
}

#[tokio::test]
async fn different_trainers_do_not_conflict() {
    let engine = seeded("different_trainers.wal").await;
    engine
        .create_appointment(ALI, MEHMET, YOGA, at(DEC9, 10, 0))
        .await
        .unwrap();
    engine
        .create_appointment(ALI, AYSE, YOGA, at(DEC9, 10, 0))
        .await
        .unwrap();
}

#[tokio::test]
async fn fee_is_snapshotted() {
    let engine = seeded("fee_snapshot.wal").await;
    let before = engine
        .create_appointment(ALI, MEHMET, YOGA, at(DEC9, 10, 0))
        .await
        .unwrap();
    engine
        .put_service(YOGA, "Yoga".into(), 60, Decimal::new(25_050, 2))
        .await
        .unwrap();
    let after = engine
        .create_appointment(ALI, MEHMET, YOGA, at(DEC9, 12, 0))
        .await
        .unwrap();

    assert_eq!(engine.get_appointment(before.id).await.unwrap().fee, Decimal::from(200));
    assert_eq!(after.fee, Decimal::new(25_050, 2));
}

#[tokio::test]
async fn ids_increase() {
    let engine = seeded("ids_increase.wal").await;
    let a = engine
        .create_appointment(ALI, MEHMET, YOGA, at(DEC9, 10, 0))
        .await
        .unwrap();
    let b = engine
        .create_appointment(ALI, MEHMET, YOGA, at(DEC9, 12, 0))
        .await
        .unwrap();
    assert!(b.id > a.id);
}

#[tokio::test]
async fn clock_controls_past_check() {
    let clock = Arc::new(FixedClock::new(NOW));
    let engine = Engine::with_clock(test_wal_path("clock_moves.wal"), clock.clone()).unwrap();
    seed(&engine).await;

    clock.set(DEC9 + 12 * H);
    let err = engine
        .create_appointment(ALI, MEHMET, YOGA, at(DEC9, 10, 0))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    engine
        .create_appointment(ALI, MEHMET, YOGA, at(DEC9, 13, 0))
        .await
        .unwrap();
}

// ── Status transitions ───────────────────────────────────

#[tokio::test]
async fn approve_then_cancel() {
    let engine = seeded("approve_cancel.wal").await;
    let a = engine
        .create_appointment(ALI, MEHMET, YOGA, at(DEC9, 10, 0))
        .await
        .unwrap();
    let approved = engine.approve_appointment(a.id).await.unwrap();
    assert_eq!(approved.status, AppointmentStatus::Approved);
    let cancelled = engine.cancel_appointment(a.id).await.unwrap();
    assert_eq!(cancelled.status, AppointmentStatus::Cancelled);
}

#[tokio::test]
async fn repeated_transitions_are_noops() {
    let engine = seeded("noop_transitions.wal").await;
    let a = engine
        .create_appointment(ALI, MEHMET, YOGA, at(DEC9, 10, 0))
        .await
        .unwrap();
    engine.approve_appointment(a.id).await.unwrap();
    let again = engine.approve_appointment(a.id).await.unwrap();
    assert_eq!(again.status, AppointmentStatus::Approved);

    engine.cancel_appointment(a.id).await.unwrap();
    let again = engine.cancel_appointment(a.id).await.unwrap();
    assert_eq!(again.status, AppointmentStatus::Cancelled);

    let b = engine
        .create_appointment(ALI, MEHMET, YOGA, at(DEC9, 12, 0))
        .await
        .unwrap();
    engine.reject_appointment(b.id).await.unwrap();
    let again = engine.reject_appointment(b.id).await.unwrap();
    assert_eq!(again.status, AppointmentStatus::Rejected);
}

#[tokio::test]
async fn forbidden_transitions() {
    let engine = seeded("forbidden_transitions.wal").await;
    let rejected = engine
        .create_appointment(ALI, MEHMET, YOGA, at(DEC9, 10, 0))
        .await
        .unwrap();
    engine.reject_appointment(rejected.id).await.unwrap();

    let err = engine.cancel_appointment(rejected.id).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            from: AppointmentStatus::Rejected,
            to: AppointmentStatus::Cancelled
        }
    ));
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    assert!(engine.approve_appointment(rejected.id).await.is_err());

    let cancelled = engine
        .create_appointment(ALI, MEHMET, YOGA, at(DEC9, 12, 0))
        .await
        .unwrap();
    engine.cancel_appointment(cancelled.id).await.unwrap();
    assert!(engine.approve_appointment(cancelled.id).await.is_err());
    assert!(engine.reject_appointment(cancelled.id).await.is_err());

    let approved = engine
        .create_appointment(ALI, MEHMET, YOGA, at(DEC9, 14, 0))
        .await
        .unwrap();
    engine.approve_appointment(approved.id).await.unwrap();
    assert!(engine.reject_appointment(approved.id).await.is_err());
    assert!(
        engine
            .set_status(approved.id, AppointmentStatus::Pending)
            .await
            .is_err()
    );
    // failed transitions leave the status alone
    assert_eq!(
        engine.get_appointment(approved.id).await.unwrap().status,
        AppointmentStatus::Approved
    );
}

#[tokio::test]
async fn transitions_on_unknown_id() {
    let engine = seeded("unknown_id.wal").await;
    for result in [
        engine.cancel_appointment(404).await,
        engine.approve_appointment(404).await,
        engine.reject_appointment(404).await,
        engine.get_appointment(404).await,
    ] {
        assert!(matches!(result, Err(EngineError::NotFound(Entity::Appointment(404)))));
    }
}

#[tokio::test]
async fn set_status_dispatches() {
    let engine = seeded("set_status.wal").await;
    let a = engine
        .create_appointment(ALI, MEHMET, YOGA, at(DEC9, 10, 0))
        .await
        .unwrap();
    let updated = engine
        .set_status(a.id, AppointmentStatus::Approved)
        .await
        .unwrap();
    assert_eq!(updated.status, AppointmentStatus::Approved);
}

// ── Queries ──────────────────────────────────────────────

async fn booked_week(engine: &Engine) -> Vec<Appointment> {
    let mut out = Vec::new();
    for (member, trainer, start) in [
        (ALI, MEHMET, at(DEC9, 14, 0)),
        (VELI, MEHMET, at(DEC9, 10, 0)),
        (ALI, AYSE, at(DEC9, 10, 0)),
        (ALI, MEHMET, at(DEC9 + DAY, 10, 0)),
        (VELI, AYSE, at(DEC9 + 2 * DAY, 9, 0)),
    ] {
        out.push(
            engine
                .create_appointment(member, trainer, YOGA, start)
                .await
                .unwrap(),
        );
    }
    out
}

fn ids(appointments: &[Appointment]) -> Vec<AppointmentId> {
    appointments.iter().map(|a| a.id).collect()
}

#[tokio::test]
async fn list_by_member_sorted_and_filtered() {
    let engine = seeded("list_member.wal").await;
    let b = booked_week(&engine).await;

    let all = engine.list_by_member(ALI, None, None).await.unwrap();
    assert_eq!(ids(&all), vec![b[2].id, b[0].id, b[3].id]);

    let window = engine
        .list_by_member(ALI, Some(at(DEC9, 12, 0)), Some(at(DEC9, 15, 0)))
        .await
        .unwrap();
    assert_eq!(ids(&window), vec![b[0].id]);

    // `until` bounds the end, not the start
    let cut = engine
        .list_by_member(ALI, None, Some(at(DEC9, 14, 30)))
        .await
        .unwrap();
    assert_eq!(ids(&cut), vec![b[2].id]);

    assert!(matches!(
        engine.list_by_member(99, None, None).await,
        Err(EngineError::NotFound(Entity::Member(99)))
    ));
}

#[tokio::test]
async fn list_by_trainer_sorted() {
    let engine = seeded("list_trainer.wal").await;
    let b = booked_week(&engine).await;
    let mehmet = engine.list_by_trainer(MEHMET, None, None).await.unwrap();
    assert_eq!(ids(&mehmet), vec![b[1].id, b[0].id, b[3].id]);
    let later = engine
        .list_by_trainer(MEHMET, Some(at(DEC9 + DAY, 0, 0)), None)
        .await
        .unwrap();
    assert_eq!(ids(&later), vec![b[3].id]);
    assert!(engine.list_by_trainer(99, None, None).await.is_err());
}

#[tokio::test]
async fn list_by_status_and_counts() {
    let engine = seeded("list_status.wal").await;
    let b = booked_week(&engine).await;
    engine.approve_appointment(b[0].id).await.unwrap();
    engine.reject_appointment(b[1].id).await.unwrap();
    engine.cancel_appointment(b[2].id).await.unwrap();

    let pending = engine.list_by_status(AppointmentStatus::Pending).await;
    assert_eq!(ids(&pending), vec![b[3].id, b[4].id]);
    let approved = engine.list_by_status(AppointmentStatus::Approved).await;
    assert_eq!(ids(&approved), vec![b[0].id]);

    let counts = engine.status_counts().await;
    assert_eq!(
        counts,
        StatusCounts {
            total: 5,
            pending: 2,
            approved: 1,
            rejected: 1,
            cancelled: 1,
        }
    );
}

#[tokio::test]
async fn list_by_date_range_uses_start_date() {
    let engine = seeded("list_dates.wal").await;
    let b = booked_week(&engine).await;
    let dec9 = NaiveDate::from_ymd_opt(2025, 12, 9).unwrap();
    let dec10 = NaiveDate::from_ymd_opt(2025, 12, 10).unwrap();

    let one_day = engine.list_by_date_range(dec9, dec9).await.unwrap();
    assert_eq!(ids(&one_day), vec![b[1].id, b[2].id, b[0].id]);

    let two_days = engine.list_by_date_range(dec9, dec10).await.unwrap();
    assert_eq!(two_days.len(), 4);

    let err = engine.list_by_date_range(dec10, dec9).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}

#[tokio::test]
async fn list_all_sorted() {
    let engine = seeded("list_all.wal").await;
    let b = booked_week(&engine).await;
    let all = engine.list_all().await;
    // b[1] and b[2] start together; id breaks the tie
    assert_eq!(
        ids(&all),
        vec![b[1].id, b[2].id, b[0].id, b[3].id, b[4].id]
    );
}

#[tokio::test]
async fn empty_queries_succeed() {
    let engine = seeded("empty_queries.wal").await;
    assert!(engine.list_all().await.is_empty());
    assert!(engine.list_by_member(ALI, None, None).await.unwrap().is_empty());
    assert_eq!(engine.status_counts().await, StatusCounts::default());
}

// ── Coarse availability ──────────────────────────────────

#[tokio::test]
async fn availability_respects_window() {
    let engine = seeded("avail_window.wal").await;
    let dec10 = DEC9 + DAY;
    assert!(!engine.is_trainer_available(AYSE, at(dec10, 8, 0)).await.unwrap());
    assert!(engine.is_trainer_available(AYSE, at(dec10, 9, 0)).await.unwrap());
    assert!(engine.is_trainer_available(AYSE, at(dec10, 18, 0)).await.unwrap());
    assert!(!engine.is_trainer_available(AYSE, at(dec10, 18, 1)).await.unwrap());
    assert!(engine.is_trainer_available(MEHMET, at(dec10, 3, 0)).await.unwrap());
}

#[tokio::test]
async fn availability_is_whole_day() {
    let engine = seeded("avail_day.wal").await;
    let dec10 = DEC9 + DAY;
    let a = engine
        .create_appointment(ALI, AYSE, YOGA, at(dec10, 14, 0))
        .await
        .unwrap();
    // a free hour on a day with any booking still reads as unavailable
    assert!(!engine.is_trainer_available(AYSE, at(dec10, 10, 0)).await.unwrap());
    assert!(engine.is_trainer_available(AYSE, at(DEC9, 10, 0)).await.unwrap());

    engine.cancel_appointment(a.id).await.unwrap();
    assert!(engine.is_trainer_available(AYSE, at(dec10, 10, 0)).await.unwrap());

    assert!(matches!(
        engine.is_trainer_available(99, NOW).await,
        Err(EngineError::NotFound(Entity::Trainer(99)))
    ));
}

#[tokio::test]
async fn available_trainers_lists_free_ones_by_name() {
    let engine = seeded("avail_list.wal").await;
    let dec10 = DEC9 + DAY;
    let names = |trainers: Vec<TrainerInfo>| -> Vec<String> {
        trainers.into_iter().map(|t| t.name).collect()
    };

    assert_eq!(names(engine.available_trainers(at(dec10, 10, 0)).await), ["Ayşe", "Mehmet"]);
    // outside Ayşe's window only the unrestricted trainer is listed
    assert_eq!(names(engine.available_trainers(at(dec10, 20, 0)).await), ["Mehmet"]);

    let a = engine
        .create_appointment(VELI, MEHMET, YOGA, at(dec10, 7, 0))
        .await
        .unwrap();
    assert_eq!(names(engine.available_trainers(at(dec10, 10, 0)).await), ["Ayşe"]);
    assert_eq!(
        names(engine.available_trainers(at(DEC9, 10, 0)).await),
        ["Ayşe", "Mehmet"]
    );

    engine.cancel_appointment(a.id).await.unwrap();
    assert_eq!(engine.available_trainers(at(dec10, 10, 0)).await.len(), 2);
}

// ── Directory ────────────────────────────────────────────

#[tokio::test]
async fn directory_lookups() {
    let engine = seeded("directory.wal").await;
    let ayse = engine.trainer(AYSE).await.unwrap();
    assert_eq!(ayse.name, "Ayşe");
    assert_eq!(ayse.working_hours, WorkingHours::new(hm(9, 0), hm(18, 0)));
    assert_eq!(engine.service(PILATES).unwrap().duration_minutes, 45);
    assert_eq!(engine.member(VELI).unwrap().principal, "veli");
    assert_eq!(engine.member_for_principal("ali"), Some(ALI));
    assert_eq!(engine.member_for_principal("nobody"), None);

    let trainers: Vec<TrainerId> = engine.list_trainers().await.iter().map(|t| t.id).collect();
    assert_eq!(trainers, vec![AYSE, MEHMET]);
    assert_eq!(engine.list_services().len(), 2);
    assert_eq!(engine.list_members().len(), 2);
}

#[tokio::test]
async fn trainer_hours_can_be_lifted() {
    let engine = seeded("trainer_rehours.wal").await;
    assert!(
        engine
            .create_appointment(ALI, AYSE, YOGA, at(DEC9, 20, 0))
            .await
            .is_err()
    );
    engine.put_trainer(AYSE, "Ayşe".into(), None).await.unwrap();
    engine
        .create_appointment(ALI, AYSE, YOGA, at(DEC9, 20, 0))
        .await
        .unwrap();
}

#[tokio::test]
async fn service_validation() {
    let engine = seeded("service_validation.wal").await;
    let too_short = engine.put_service(9, "Kısa".into(), 5, Decimal::from(10)).await;
    assert!(matches!(too_short, Err(EngineError::InvalidRequest(_))));
    let too_long = engine.put_service(9, "Uzun".into(), 301, Decimal::from(10)).await;
    assert!(too_long.is_err());
    let negative = engine.put_service(9, "Bedava".into(), 30, Decimal::from(-1)).await;
    assert!(negative.is_err());
    let pricey = engine.put_service(9, "Lüks".into(), 30, Decimal::from(10_001)).await;
    assert!(pricey.is_err());
    let blank = engine.put_service(9, "  ".into(), 30, Decimal::from(10)).await;
    assert!(blank.is_err());
    engine
        .put_service(9, "Ücretsiz".into(), 30, Decimal::ZERO)
        .await
        .unwrap();
}

#[tokio::test]
async fn principal_is_unique() {
    let engine = seeded("principal_unique.wal").await;
    let err = engine
        .put_member(3, "Ali İkinci".into(), "ali".into())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(Entity::Principal(_))));

    // renaming a member's login frees the old one
    engine.put_member(ALI, "Ali".into(), "ali2".into()).await.unwrap();
    assert_eq!(engine.member_for_principal("ali"), None);
    assert_eq!(engine.member_for_principal("ali2"), Some(ALI));
    engine.put_member(3, "Ali İkinci".into(), "ali".into()).await.unwrap();
}

// ── Caller-scoped access ─────────────────────────────────

#[tokio::test]
async fn resolve_caller_from_login() {
    let engine = seeded("resolve_caller.wal").await;
    assert_eq!(engine.resolve_caller("admin", "admin").unwrap(), Caller::Admin);
    assert_eq!(engine.resolve_caller("veli", "admin").unwrap(), Caller::Member(VELI));
    let err = engine.resolve_caller("stranger", "admin").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
}

#[tokio::test]
async fn members_book_only_for_themselves() {
    let engine = seeded("access_book.wal").await;
    let err = engine
        .book_as(Caller::Member(ALI), VELI, MEHMET, YOGA, at(DEC9, 10, 0))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    engine
        .book_as(Caller::Member(ALI), ALI, MEHMET, YOGA, at(DEC9, 10, 0))
        .await
        .unwrap();
    engine
        .book_as(Caller::Admin, VELI, MEHMET, YOGA, at(DEC9, 12, 0))
        .await
        .unwrap();
}

#[tokio::test]
async fn members_cancel_only_their_own() {
    let engine = seeded("access_cancel.wal").await;
    let a = engine
        .create_appointment(ALI, MEHMET, YOGA, at(DEC9, 10, 0))
        .await
        .unwrap();
    let err = engine.cancel_as(Caller::Member(VELI), a.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    let cancelled = engine.cancel_as(Caller::Member(ALI), a.id).await.unwrap();
    assert_eq!(cancelled.status, AppointmentStatus::Cancelled);

    let b = engine
        .create_appointment(ALI, MEHMET, YOGA, at(DEC9, 12, 0))
        .await
        .unwrap();
    engine.cancel_as(Caller::Admin, b.id).await.unwrap();
}

#[tokio::test]
async fn only_admin_changes_status() {
    let engine = seeded("access_status.wal").await;
    let a = engine
        .create_appointment(ALI, MEHMET, YOGA, at(DEC9, 10, 0))
        .await
        .unwrap();
    let err = engine
        .set_status_as(Caller::Member(ALI), a.id, AppointmentStatus::Approved)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    engine
        .set_status_as(Caller::Admin, a.id, AppointmentStatus::Approved)
        .await
        .unwrap();
    // cancelling through a status change follows the cancel rule
    engine
        .set_status_as(Caller::Member(ALI), a.id, AppointmentStatus::Cancelled)
        .await
        .unwrap();
    assert!(require_admin(Caller::Member(ALI), "stats").is_err());
    assert!(require_admin(Caller::Admin, "stats").is_ok());
}

#[tokio::test]
async fn members_read_only_their_own() {
    let engine = seeded("access_read.wal").await;
    let a = engine
        .create_appointment(ALI, MEHMET, YOGA, at(DEC9, 10, 0))
        .await
        .unwrap();
    assert!(engine.appointment_as(Caller::Member(ALI), a.id).await.is_ok());
    assert!(engine.appointment_as(Caller::Admin, a.id).await.is_ok());
    let err = engine.appointment_as(Caller::Member(VELI), a.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let mine = engine
        .member_appointments_as(Caller::Member(ALI), ALI, None, None)
        .await
        .unwrap();
    assert_eq!(mine.len(), 1);
    assert!(
        engine
            .member_appointments_as(Caller::Member(VELI), ALI, None, None)
            .await
            .is_err()
    );
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_same_slot_single_winner() {
    let engine = Arc::new(seeded("concurrent_slot.wal").await);
    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        let member = if i % 2 == 0 { ALI } else { VELI };
        handles.push(tokio::spawn(async move {
            engine
                .create_appointment(member, MEHMET, YOGA, at(DEC9, 10, 15))
                .await
        }));
    }
    let mut ok = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(conflicts, 15);
    assert_eq!(engine.list_by_trainer(MEHMET, None, None).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_durations_never_overlap() {
    let engine = Arc::new(seeded("concurrent_overlap.wal").await);
    let mut handles = Vec::new();
    for i in 0..12 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let service = if i % 2 == 0 { YOGA } else { PILATES };
            engine
                .create_appointment(ALI, MEHMET, service, at(DEC9, 10, 0) + i * 10 * M)
                .await
        }));
    }
    for h in handles {
        let _ = h.await.unwrap();
    }
    let booked = engine.list_by_trainer(MEHMET, None, None).await.unwrap();
    for pair in booked.windows(2) {
        assert!(pair[0].span.end <= pair[1].span.start);
    }
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn wal_replay_restores_state() {
    let path = test_wal_path("replay.wal");
    let (approved, cancelled, pending) = {
        let engine = open(path.clone());
        seed(&engine).await;
        let a = engine
            .create_appointment(ALI, MEHMET, YOGA, at(DEC9, 10, 0))
            .await
            .unwrap();
        let b = engine
            .create_appointment(VELI, AYSE, PILATES, at(DEC9, 10, 0))
            .await
            .unwrap();
        let c = engine
            .create_appointment(ALI, AYSE, YOGA, at(DEC9, 12, 0))
            .await
            .unwrap();
        engine.approve_appointment(a.id).await.unwrap();
        engine.cancel_appointment(b.id).await.unwrap();
        (a.id, b.id, c.id)
    };

    let engine = open(path);
    assert_eq!(
        engine.get_appointment(approved).await.unwrap().status,
        AppointmentStatus::Approved
    );
    assert_eq!(
        engine.get_appointment(cancelled).await.unwrap().status,
        AppointmentStatus::Cancelled
    );
    let c = engine.get_appointment(pending).await.unwrap();
    assert_eq!(c.fee, Decimal::from(200));
    assert_eq!(c.span.duration_ms(), 60 * M);
    assert_eq!(engine.member_for_principal("veli"), Some(VELI));
    assert_eq!(engine.service(PILATES).unwrap().fee, Decimal::from(150));

    // counter resumes past the highest replayed id
    let next = engine
        .create_appointment(VELI, MEHMET, YOGA, at(DEC9, 15, 0))
        .await
        .unwrap();
    assert!(next.id > pending);

    // replayed appointments still block
    let err = engine
        .create_appointment(VELI, MEHMET, YOGA, at(DEC9, 10, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(id) if id == approved));
}

#[tokio::test]
async fn bookings_after_torn_tail_survive_next_restart() {
    let path = test_wal_path("torn_restart.wal");
    {
        let engine = open(path.clone());
        seed(&engine).await;
        engine
            .create_appointment(ALI, AYSE, YOGA, at(DEC9, 10, 0))
            .await
            .unwrap();
    }
    {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[7u8; 6]).unwrap();
    }

    let second = {
        let engine = open(path.clone());
        assert_eq!(engine.list_all().await.len(), 1);
        engine
            .create_appointment(VELI, AYSE, YOGA, at(DEC9, 12, 0))
            .await
            .unwrap()
    };

    let engine = open(path);
    let all = engine.list_all().await;
    assert_eq!(all.len(), 2);
    assert_eq!(engine.get_appointment(second.id).await.unwrap().member_id, VELI);
    let err = engine
        .create_appointment(ALI, AYSE, YOGA, at(DEC9, 12, 30))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(id) if id == second.id));
}

#[tokio::test]
async fn compact_wal_preserves_state() {
    let path = test_wal_path("compact_state.wal");
    let engine = open(path.clone());
    seed(&engine).await;
    let a = engine
        .create_appointment(ALI, MEHMET, YOGA, at(DEC9, 10, 0))
        .await
        .unwrap();
    // churn the directory so compaction has something to drop
    for fee in 1..20 {
        engine
            .put_service(PILATES, "Pilates".into(), 45, Decimal::from(fee))
            .await
            .unwrap();
    }
    engine.approve_appointment(a.id).await.unwrap();
    let before = engine.list_all().await;

    let size_before = std::fs::metadata(&path).unwrap().len();
    assert!(engine.wal_appends_since_compact().await > 0);
    engine.compact_wal().await.unwrap();
    let size_after = std::fs::metadata(&path).unwrap().len();
    assert!(size_after < size_before, "compacted WAL ({size_after}) should be smaller than original ({size_before})");
    assert_eq!(engine.wal_appends_since_compact().await, 0);
    assert_eq!(engine.list_all().await, before);

    // appends after compaction land in the new file
    let b = engine
        .create_appointment(VELI, MEHMET, YOGA, at(DEC9, 12, 0))
        .await
        .unwrap();
    drop(engine);

    let reopened = open(path);
    let all = reopened.list_all().await;
    assert_eq!(ids(&all), vec![a.id, b.id]);
    assert_eq!(all[0].status, AppointmentStatus::Approved);
    assert_eq!(reopened.service(PILATES).unwrap().fee, Decimal::from(19));
    assert_eq!(
        reopened.trainer(AYSE).await.unwrap().working_hours,
        WorkingHours::new(hm(9, 0), hm(18, 0))
    );
}

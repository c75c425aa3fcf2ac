//! End-to-end scenarios through the engine.
//!
//! Command → cell/document aggregates → EventStore → EventBus, and back
//! again through `InventoryEngine::restore`.

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    use chrono::NaiveDate;
    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use serde_json::Value as JsonValue;

    use depotledger_core::{ErrorKind, UserId};
    use depotledger_events::{EventEnvelope, InMemoryEventBus};
    use depotledger_inventory::{
        AlertLevel, Article, InventoryScope, LineDecision, LotAttributes, LotStatus,
        ReservationStatus, StockThresholds, TransferLineRequest, TransferStatus, ValuationMethod,
        Warehouse,
    };

    use crate::catalog::InMemoryCatalog;
    use crate::config::EngineConfig;
    use crate::engine::{
        DirectExit, InventoryEngine, ReceiptRequest, Reception, ReservationRequest, StockAlert,
        TransferRequest,
    };
    use crate::event_store::{EventStore, InMemoryEventStore};
    use crate::workers::ReservationSweeper;

    type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
    type Engine = InventoryEngine<Arc<InMemoryEventStore>, Bus, Arc<InMemoryCatalog>>;

    struct World {
        store: Arc<InMemoryEventStore>,
        bus: Bus,
        catalog: Arc<InMemoryCatalog>,
        north: Warehouse,
        south: Warehouse,
        actor: UserId,
    }

    impl World {
        fn new() -> Self {
            let catalog = Arc::new(InMemoryCatalog::new());
            let north = Warehouse::new("WH-N", "North");
            let south = Warehouse::new("WH-S", "South");
            catalog.add_warehouse(north.clone());
            catalog.add_warehouse(south.clone());
            Self {
                store: Arc::new(InMemoryEventStore::new()),
                bus: Arc::new(InMemoryEventBus::new()),
                catalog,
                north,
                south,
                actor: UserId::new(),
            }
        }

        fn article(&self, article: Article) -> Article {
            self.catalog.upsert_article(article.clone()).unwrap();
            article
        }

        fn engine(&self) -> Engine {
            InventoryEngine::new(
                Arc::clone(&self.store),
                Arc::clone(&self.bus),
                Arc::clone(&self.catalog),
                EngineConfig::default(),
            )
        }

        fn restored(&self) -> Engine {
            InventoryEngine::restore(
                Arc::clone(&self.store),
                Arc::new(InMemoryEventBus::new()),
                Arc::clone(&self.catalog),
                EngineConfig::default(),
            )
            .unwrap()
        }
    }

    #[test]
    fn fifo_exit_spans_two_lots_and_values_each_at_its_cost() {
        let world = World::new();
        let bolt = world.article(Article::new("SKU-1", "Bolt").with_valuation(ValuationMethod::Fifo));
        let engine = world.engine();

        let first = engine
            .post_reception(Reception::new(bolt.id, world.north.id, 5, dec!(10), world.actor))
            .unwrap()
            .lot;
        let second = engine
            .post_reception(Reception::new(bolt.id, world.north.id, 5, dec!(12), world.actor))
            .unwrap()
            .lot;

        let exit = engine
            .post_direct_exit(DirectExit::sale(bolt.id, world.north.id, 7, world.actor))
            .unwrap();
        assert_eq!(exit.quantity(), 7);
        assert_eq!(exit.value(), dec!(74));
        assert_eq!(exit.movements.len(), 2);

        assert_eq!(engine.lot(first.id).unwrap().status, LotStatus::Depleted);
        assert_eq!(engine.lot(second.id).unwrap().quantity, 3);
        let level = engine.stock_level(bolt.id, world.north.id).unwrap();
        assert_eq!(level.theoretical, 3);
    }

    #[test]
    fn fefo_takes_the_earliest_expiry_first() {
        let world = World::new();
        let milk = world.article(Article::new("SKU-M", "Milk").with_valuation(ValuationMethod::Fefo));
        let engine = world.engine();
        let date = |d| NaiveDate::from_ymd_opt(2030, 1, d).unwrap();

        engine
            .post_reception(
                Reception::new(milk.id, world.north.id, 4, dec!(1), world.actor)
                    .with_attributes(LotAttributes::numbered("LATE").expiring(date(20))),
            )
            .unwrap();
        let early = engine
            .post_reception(
                Reception::new(milk.id, world.north.id, 4, dec!(1), world.actor)
                    .with_attributes(LotAttributes::numbered("EARLY").expiring(date(5))),
            )
            .unwrap()
            .lot;

        let exit = engine
            .post_direct_exit(DirectExit::sale(milk.id, world.north.id, 3, world.actor))
            .unwrap();
        assert_eq!(exit.allocations.len(), 1);
        assert_eq!(exit.allocations[0].lot_id, early.id);
    }

    #[test]
    fn concurrent_reservations_never_oversell() {
        let world = World::new();
        let bolt = world.article(Article::new("SKU-1", "Bolt"));
        let engine = Arc::new(world.engine());
        engine
            .post_reception(Reception::new(bolt.id, world.north.id, 10, dec!(1), world.actor))
            .unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|i| {
                let engine = Arc::clone(&engine);
                let barrier = Arc::clone(&barrier);
                let (article_id, warehouse_id) = (bolt.id, world.north.id);
                thread::spawn(move || {
                    barrier.wait();
                    engine.reserve(ReservationRequest::new(article_id, warehouse_id, 6, format!("SO-{i}/1")))
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let granted = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(granted, 1);
        let refused = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert_eq!(refused.kind(), ErrorKind::InsufficientAvailability);

        let level = engine.stock_level(bolt.id, world.north.id).unwrap();
        assert_eq!((level.theoretical, level.reserved), (10, 6));
    }

    #[test]
    fn transfer_conserves_value_across_warehouses_and_transit() {
        let world = World::new();
        let bolt = world.article(Article::new("SKU-1", "Bolt"));
        let engine = world.engine();
        engine
            .post_reception(Reception::new(bolt.id, world.north.id, 6, dec!(10), world.actor))
            .unwrap();
        engine
            .post_reception(Reception::new(bolt.id, world.north.id, 6, dec!(13), world.actor))
            .unwrap();
        let before = engine.valuation_snapshot(bolt.id, None).unwrap();

        let transfer = engine
            .create_transfer(TransferRequest {
                source: world.north.id,
                destination: world.south.id,
                lines: vec![TransferLineRequest {
                    article_id: bolt.id,
                    lot_id: None,
                    quantity: 9,
                }],
                actor: world.actor,
            })
            .unwrap();
        let id = transfer.id_typed();
        engine.validate_transfer(id).unwrap();
        let shipped = engine.ship_transfer(id, world.actor).unwrap();
        assert_eq!(shipped.status(), TransferStatus::Shipped);
        assert_eq!(shipped.lines()[0].shipped_value(), dec!(99));

        let received = engine
            .receive_transfer(ReceiptRequest::complete(id, world.actor).with_line(1, 8))
            .unwrap();
        assert_eq!(received.status(), TransferStatus::Received);

        let north = engine.valuation_snapshot(bolt.id, Some(world.north.id)).unwrap();
        let south = engine.valuation_snapshot(bolt.id, Some(world.south.id)).unwrap();
        let lost: Decimal = received.variances().iter().map(|v| v.value).sum();
        assert_eq!((north.quantity, south.quantity), (3, 8));
        assert_eq!(lost, dec!(13));
        assert_eq!(north.value + south.value + lost, before.value);
    }

    #[test]
    fn count_adjustment_posts_the_shortfall() {
        let world = World::new();
        let bolt = world.article(Article::new("SKU-1", "Bolt"));
        let engine = world.engine();
        engine
            .post_reception(Reception::new(bolt.id, world.north.id, 100, dec!(2), world.actor))
            .unwrap();

        let session = engine
            .open_inventory_session(InventoryScope::warehouse(world.north.id), world.actor)
            .unwrap();
        let line_id = session.lines()[0].id;
        let entry = engine.record_count(line_id, 95).unwrap();
        assert_eq!(entry.variance(), -5);
        assert!(!entry.recount_required);

        engine
            .validate_line(line_id, LineDecision::Adjust, false, world.actor)
            .unwrap();
        engine.close_session(session.id_typed()).unwrap();

        assert_eq!(engine.stock_level(bolt.id, world.north.id).unwrap().theoretical, 95);
        let session = engine.session(session.id_typed()).unwrap();
        assert_eq!(session.adjustments()[0].value, dec!(-10));
        let movement_id = session.adjustments()[0].movements[0];
        let posted = engine
            .movements_for(bolt.id, world.north.id, None, None)
            .unwrap()
            .into_iter()
            .find(|m| m.id == movement_id)
            .unwrap();
        assert_eq!(posted.quantity, -5);
    }

    #[test]
    fn restore_rebuilds_the_same_state_from_the_store() {
        let world = World::new();
        let bolt = world.article(Article::new("SKU-1", "Bolt"));
        let engine = world.engine();
        engine
            .post_reception(Reception::new(bolt.id, world.north.id, 10, dec!(3), world.actor))
            .unwrap();
        let reservation = engine
            .reserve(ReservationRequest::new(bolt.id, world.north.id, 4, "SO-1/1"))
            .unwrap();
        engine.pick(reservation.id, 1, world.actor).unwrap();
        let transfer = engine
            .create_transfer(TransferRequest {
                source: world.north.id,
                destination: world.south.id,
                lines: vec![TransferLineRequest {
                    article_id: bolt.id,
                    lot_id: None,
                    quantity: 2,
                }],
                actor: world.actor,
            })
            .unwrap();
        engine.validate_transfer(transfer.id_typed()).unwrap();
        engine.ship_transfer(transfer.id_typed(), world.actor).unwrap();

        let restored = world.restored();
        for warehouse in [world.north.id, world.south.id] {
            assert_eq!(
                restored.stock_level(bolt.id, warehouse).unwrap(),
                engine.stock_level(bolt.id, warehouse).unwrap()
            );
            assert_eq!(
                restored.lots(bolt.id, warehouse).unwrap(),
                engine.lots(bolt.id, warehouse).unwrap()
            );
        }
        assert_eq!(restored.reservation(reservation.id).unwrap().status, ReservationStatus::Partial);
        assert_eq!(
            restored.transfer(transfer.id_typed()).unwrap(),
            engine.transfer(transfer.id_typed()).unwrap()
        );

        // The restored engine carries on where the first one stopped.
        restored
            .receive_transfer(ReceiptRequest::complete(transfer.id_typed(), world.actor))
            .unwrap();
        assert_eq!(restored.stock_level(bolt.id, world.south.id).unwrap().theoretical, 2);
    }

    #[test]
    fn committed_events_and_alerts_reach_subscribers() {
        let world = World::new();
        let bolt = world.article(Article::new("SKU-1", "Bolt").with_thresholds(StockThresholds {
            minimum: Some(5),
            safety: Some(2),
            maximum: None,
        }));
        let engine = world.engine();
        let sub = engine.subscribe();

        engine
            .post_reception(Reception::new(bolt.id, world.north.id, 6, dec!(1), world.actor))
            .unwrap();
        let received: Vec<String> = sub.drain().iter().map(|e| e.event_type().to_owned()).collect();
        assert!(received.contains(&"inventory.stock.lot_created".to_owned()));
        assert!(received.contains(&"inventory.stock.movement_posted".to_owned()));

        engine
            .post_direct_exit(DirectExit::sale(bolt.id, world.north.id, 5, world.actor))
            .unwrap();
        let alerts: Vec<StockAlert> = sub
            .drain()
            .into_iter()
            .filter(|e| e.event_type() == "inventory.stock.alert")
            .map(|e| serde_json::from_value(e.into_payload()).unwrap())
            .collect();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, AlertLevel::BelowSafety);
        assert_eq!((alerts[0].available, alerts[0].threshold), (1, 2));
    }

    #[test]
    fn rejected_commands_leave_no_trace() {
        let world = World::new();
        let bolt = world.article(Article::new("SKU-1", "Bolt"));
        let engine = world.engine();
        engine
            .post_reception(Reception::new(bolt.id, world.north.id, 3, dec!(1), world.actor))
            .unwrap();
        let streams_before = world.store.streams().unwrap();
        let events_before = world.store.load_stream(streams_before[0]).unwrap().len();

        let err = engine
            .post_direct_exit(DirectExit::sale(bolt.id, world.north.id, 4, world.actor))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientAvailability);
        assert_eq!(world.store.load_stream(streams_before[0]).unwrap().len(), events_before);
        assert_eq!(engine.stock_level(bolt.id, world.north.id).unwrap().theoretical, 3);
    }

    #[test]
    fn sweeper_expires_overdue_reservations() {
        let world = World::new();
        let bolt = world.article(Article::new("SKU-1", "Bolt"));
        let engine = Arc::new(world.engine());
        engine
            .post_reception(Reception::new(bolt.id, world.north.id, 10, dec!(1), world.actor))
            .unwrap();
        let reservation = engine
            .reserve(
                ReservationRequest::new(bolt.id, world.north.id, 4, "SO-9/1")
                    .with_ttl(chrono::Duration::milliseconds(1)),
            )
            .unwrap();

        let sweeping = Arc::clone(&engine);
        let worker = ReservationSweeper::spawn("test-sweeper", Duration::from_millis(10), move |now| {
            sweeping.expire_due_reservations(now)
        })
        .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while engine.reservation(reservation.id).unwrap().status == ReservationStatus::Active
            && std::time::Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(10));
        }
        worker.shutdown();

        assert_eq!(engine.reservation(reservation.id).unwrap().status, ReservationStatus::Expired);
        assert_eq!(engine.stock_level(bolt.id, world.north.id).unwrap().reserved, 0);
    }

    #[test]
    fn full_transfer_moves_stock_and_value_intact() {
        let world = World::new();
        let bolt = world.article(Article::new("SKU-X", "Bracket"));
        let engine = world.engine();
        engine
            .post_reception(Reception::new(bolt.id, world.north.id, 10, dec!(7.5), world.actor))
            .unwrap();
        let before = engine.valuation_snapshot(bolt.id, None).unwrap();

        let id = engine
            .create_transfer(TransferRequest {
                source: world.north.id,
                destination: world.south.id,
                lines: vec![TransferLineRequest {
                    article_id: bolt.id,
                    lot_id: None,
                    quantity: 10,
                }],
                actor: world.actor,
            })
            .unwrap()
            .id_typed();
        engine.validate_transfer(id).unwrap();
        engine.ship_transfer(id, world.actor).unwrap();
        assert_eq!(engine.stock_level(bolt.id, world.north.id).unwrap().theoretical, 0);

        let received = engine
            .receive_transfer(ReceiptRequest::complete(id, world.actor).with_line(1, 10))
            .unwrap();
        assert!(received.variances().is_empty());
        assert_eq!(engine.stock_level(bolt.id, world.north.id).unwrap().theoretical, 0);
        assert_eq!(engine.stock_level(bolt.id, world.south.id).unwrap().theoretical, 10);

        let after = engine.valuation_snapshot(bolt.id, None).unwrap();
        assert_eq!((after.quantity, after.value), (before.quantity, before.value));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Receive { south: bool, quantity: i64 },
        Sell { south: bool, quantity: i64 },
        Reserve { south: bool, quantity: i64 },
        PickLatest { quantity: i64 },
        CancelLatest,
        Transfer { quantity: i64 },
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (any::<bool>(), 1i64..20).prop_map(|(south, quantity)| Op::Receive { south, quantity }),
            (any::<bool>(), 1i64..15).prop_map(|(south, quantity)| Op::Sell { south, quantity }),
            (any::<bool>(), 1i64..10).prop_map(|(south, quantity)| Op::Reserve { south, quantity }),
            (1i64..6).prop_map(|quantity| Op::PickLatest { quantity }),
            Just(Op::CancelLatest),
            (1i64..12).prop_map(|quantity| Op::Transfer { quantity }),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 32,
            ..ProptestConfig::default()
        })]

        /// Property: whatever mix of operations is accepted or refused, every
        /// pair keeps 0 ≤ reserved ≤ theoretical, its lots add up to its
        /// ledger, and a restore from the store reproduces it.
        #[test]
        fn invariants_hold_and_restore_reproduces_every_pair(ops in prop::collection::vec(op(), 1..30)) {
            let world = World::new();
            let bolt = world.article(Article::new("SKU-P", "Pin"));
            let engine = world.engine();
            let warehouse = |south: bool| if south { world.south.id } else { world.north.id };
            let mut reservations = Vec::new();

            for op in ops {
                // Refusals are part of the property; only the invariants matter.
                match op {
                    Op::Receive { south, quantity } => {
                        let _ = engine.post_reception(Reception::new(bolt.id, warehouse(south), quantity, dec!(2), world.actor));
                    }
                    Op::Sell { south, quantity } => {
                        let _ = engine.post_direct_exit(DirectExit::sale(bolt.id, warehouse(south), quantity, world.actor));
                    }
                    Op::Reserve { south, quantity } => {
                        if let Ok(r) = engine.reserve(ReservationRequest::new(bolt.id, warehouse(south), quantity, "SO-P/1")) {
                            reservations.push(r.id);
                        }
                    }
                    Op::PickLatest { quantity } => {
                        if let Some(id) = reservations.last() {
                            let _ = engine.pick(*id, quantity, world.actor);
                        }
                    }
                    Op::CancelLatest => {
                        if let Some(id) = reservations.pop() {
                            let _ = engine.cancel_reservation(id);
                        }
                    }
                    Op::Transfer { quantity } => {
                        let request = TransferRequest {
                            source: world.north.id,
                            destination: world.south.id,
                            lines: vec![TransferLineRequest { article_id: bolt.id, lot_id: None, quantity }],
                            actor: world.actor,
                        };
                        if let Ok(t) = engine.create_transfer(request) {
                            let id = t.id_typed();
                            if engine.validate_transfer(id).is_ok() && engine.ship_transfer(id, world.actor).is_ok() {
                                engine.receive_transfer(ReceiptRequest::complete(id, world.actor)).unwrap();
                            }
                        }
                    }
                }

                for south in [false, true] {
                    let level = engine.stock_level(bolt.id, warehouse(south)).unwrap();
                    prop_assert!(level.reserved >= 0);
                    prop_assert!(level.available() >= 0);
                    let in_lots: i64 = engine
                        .lots(bolt.id, warehouse(south))
                        .unwrap()
                        .iter()
                        .filter(|l| l.holds_stock())
                        .map(|l| l.quantity)
                        .sum();
                    prop_assert_eq!(in_lots, level.theoretical);
                }
            }

            let restored = world.restored();
            for south in [false, true] {
                prop_assert_eq!(
                    restored.stock_level(bolt.id, warehouse(south)).unwrap(),
                    engine.stock_level(bolt.id, warehouse(south)).unwrap()
                );
                prop_assert_eq!(
                    restored.valuation_snapshot(bolt.id, Some(warehouse(south))).unwrap(),
                    engine.valuation_snapshot(bolt.id, Some(warehouse(south))).unwrap()
                );
            }
        }
    }
}

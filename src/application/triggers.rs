//! Price-trigger state machines for locally managed order types.
//!
//! Stop and trailing orders never reach the venue as-is; the order manager
//! evaluates them against every price update and submits a native child
//! order the moment one fires. `is_triggered` guards the at-most-once
//! invariant; evaluation happens inside the order manager's serialized
//! mailbox so there is no check-then-set race.

use crate::domain::order::{Order, OrderSide, OrderType};
use rust_decimal::Decimal;

/// Outcome of evaluating one price tick against one order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDecision {
    /// Nothing to do.
    Hold,
    /// The order fired at this price; submit the child order now.
    Fire,
}

/// Update trigger tracking on `order` for a new `price` and decide whether
/// it fires. Terminal, already-triggered and non-trigger orders always
/// hold.
pub fn evaluate(order: &mut Order, price: Decimal) -> TriggerDecision {
    if order.is_triggered || order.status.is_terminal() || !order.is_price_triggered_type() {
        return TriggerDecision::Hold;
    }
    match order.order_type {
        OrderType::StopMarket | OrderType::StopLimit => evaluate_stop(order, price),
        OrderType::TrailingStop => evaluate_trailing(order, price),
        _ => TriggerDecision::Hold,
    }
}

fn evaluate_stop(order: &mut Order, price: Decimal) -> TriggerDecision {
    let Some(stop) = order.stop_price else {
        return TriggerDecision::Hold;
    };
    order.trigger_price = Some(stop);
    let fired = match order.side {
        OrderSide::Buy => price >= stop,
        OrderSide::Sell => price <= stop,
    };
    if fired {
        TriggerDecision::Fire
    } else {
        TriggerDecision::Hold
    }
}

/// Trailing stop. `high_water_mark` tracks the most favorable price seen
/// since activation: the maximum for a sell stop, the minimum for a buy
/// stop. The trail offset is the wider of the absolute amount and the
/// percent of the mark, so configuring both keeps the order farther from
/// the market.
fn evaluate_trailing(order: &mut Order, price: Decimal) -> TriggerDecision {
    let mark = match (order.high_water_mark, order.side) {
        (Some(mark), OrderSide::Sell) => mark.max(price),
        (Some(mark), OrderSide::Buy) => mark.min(price),
        // First observation activates the trail at this price.
        (None, _) => price,
    };
    order.high_water_mark = Some(mark);

    let amount = order.trail_amount.unwrap_or(Decimal::ZERO);
    let percent_offset = order
        .trail_percent
        .map(|p| mark * p / Decimal::ONE_HUNDRED)
        .unwrap_or(Decimal::ZERO);
    let offset = amount.max(percent_offset);
    if offset <= Decimal::ZERO {
        return TriggerDecision::Hold;
    }

    let trigger = match order.side {
        OrderSide::Sell => mark - offset,
        OrderSide::Buy => mark + offset,
    };
    order.trigger_price = Some(trigger);

    let fired = match order.side {
        OrderSide::Sell => price <= trigger,
        OrderSide::Buy => price >= trigger,
    };
    if fired {
        TriggerDecision::Fire
    } else {
        TriggerDecision::Hold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::{OrderIntent, OrderStatus};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn trailing_sell(trail_percent: Decimal, entry: Decimal) -> Order {
        let mut intent = OrderIntent::market("BTCUSDT", OrderSide::Sell, dec!(1));
        intent.order_type = OrderType::TrailingStop;
        intent.trail_percent = Some(trail_percent);
        let mut order = Order::from_intent(1, "bybit", &intent, Utc::now());
        order.high_water_mark = Some(entry);
        order
    }

    #[test]
    fn trailing_sell_tracks_high_water_and_fires_once() {
        let mut order = trailing_sell(dec!(2), dec!(100));
        let stream = [dec!(100), dec!(110), dec!(112), dec!(108)];
        let expected_marks = [dec!(100), dec!(110), dec!(112), dec!(112)];
        let mut fired_at = None;

        for (i, price) in stream.iter().enumerate() {
            let decision = evaluate(&mut order, *price);
            assert_eq!(order.high_water_mark, Some(expected_marks[i]));
            if decision == TriggerDecision::Fire {
                fired_at = Some(i);
                order.is_triggered = true;
            }
        }

        // Trigger price froze at 112 * 0.98 = 109.76; 108 breaches it.
        assert_eq!(fired_at, Some(3));
        assert_eq!(order.trigger_price, Some(dec!(109.76)));
        // Guarded by is_triggered: further updates hold.
        assert_eq!(evaluate(&mut order, dec!(50)), TriggerDecision::Hold);
    }

    #[test]
    fn trailing_buy_tracks_low_water() {
        let mut intent = OrderIntent::market("BTCUSDT", OrderSide::Buy, dec!(1));
        intent.order_type = OrderType::TrailingStop;
        intent.trail_amount = Some(dec!(5));
        let mut order = Order::from_intent(2, "bybit", &intent, Utc::now());
        order.high_water_mark = Some(dec!(100));

        assert_eq!(evaluate(&mut order, dec!(90)), TriggerDecision::Hold);
        assert_eq!(order.high_water_mark, Some(dec!(90)));
        assert_eq!(order.trigger_price, Some(dec!(95)));
        // Rise through the trigger fires.
        assert_eq!(evaluate(&mut order, dec!(96)), TriggerDecision::Fire);
    }

    #[test]
    fn wider_of_amount_and_percent_wins() {
        let mut order = trailing_sell(dec!(2), dec!(100));
        order.trail_amount = Some(dec!(10));
        // Offset is max(10, 2) = 10, so 95 holds.
        assert_eq!(evaluate(&mut order, dec!(95)), TriggerDecision::Hold);
        // Mark stays 100; trigger at 90.
        assert_eq!(order.trigger_price, Some(dec!(90)));
        assert_eq!(evaluate(&mut order, dec!(89)), TriggerDecision::Fire);
    }

    #[test]
    fn stop_orders_fire_on_threshold() {
        let mut intent = OrderIntent::market("BTCUSDT", OrderSide::Buy, dec!(1));
        intent.order_type = OrderType::StopMarket;
        intent.stop_price = Some(dec!(105));
        let mut buy_stop = Order::from_intent(3, "bybit", &intent, Utc::now());
        assert_eq!(evaluate(&mut buy_stop, dec!(104)), TriggerDecision::Hold);
        assert_eq!(evaluate(&mut buy_stop, dec!(105)), TriggerDecision::Fire);

        let mut intent = OrderIntent::market("BTCUSDT", OrderSide::Sell, dec!(1));
        intent.order_type = OrderType::StopLimit;
        intent.stop_price = Some(dec!(95));
        intent.limit_price = Some(dec!(94));
        let mut sell_stop = Order::from_intent(4, "bybit", &intent, Utc::now());
        assert_eq!(evaluate(&mut sell_stop, dec!(96)), TriggerDecision::Hold);
        assert_eq!(evaluate(&mut sell_stop, dec!(95)), TriggerDecision::Fire);
    }

    #[test]
    fn terminal_and_triggered_orders_hold() {
        let mut order = trailing_sell(dec!(2), dec!(100));
        order.status = OrderStatus::Cancelled;
        assert_eq!(evaluate(&mut order, dec!(1)), TriggerDecision::Hold);

        let mut order = trailing_sell(dec!(2), dec!(100));
        order.is_triggered = true;
        assert_eq!(evaluate(&mut order, dec!(1)), TriggerDecision::Hold);
    }

    #[test]
    fn first_price_activates_an_unseeded_trail() {
        let mut order = trailing_sell(dec!(2), dec!(100));
        order.high_water_mark = None;
        assert_eq!(evaluate(&mut order, dec!(200)), TriggerDecision::Hold);
        assert_eq!(order.high_water_mark, Some(dec!(200)));
        assert_eq!(order.trigger_price, Some(dec!(196)));
    }
}

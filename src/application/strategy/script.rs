//! Embedded script host for strategy and rebalancer scripts.
//!
//! Scripts are compiled once and called per event. The sandbox admits no
//! I/O, no module imports and no clock: the only packages registered are
//! core language, collections, math and strings, plus the host functions
//! below. Per-callback execution is bounded by a wall-clock watchdog and an
//! operation ceiling; per-instance state lives in a map bound as `this`
//! and survives across invocations.
//!
//! Host surface available inside scripts:
//! - series accessors `opens()`, `highs()`, `lows()`, `closes()`, `volumes()`
//! - the indicator library (`sma`, `ema`, `rsi`, `macd`, ... full list in
//!   [`crate::indicators`]), `highest`/`lowest`/`crossover`/`crossunder`
//! - `signal(side, quantity)` / `signal(side, quantity, opts)`
//! - `log(message)`, `position()`, `balances()`

use crate::domain::errors::CoreError;
use crate::domain::market::{Kline, OrderBookSnapshot, Ticker};
use crate::domain::order::{OrderIntent, OrderSide, OrderType};
use crate::domain::portfolio::{Balance, Position};
use crate::indicators;
use rhai::packages::{
    BasicArrayPackage, BasicMapPackage, BasicMathPackage, CorePackage, MoreStringPackage, Package,
};
use rhai::{AST, Array, CallFnOptions, Dynamic, Engine, EvalAltResult, Map, Scope};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::info;

/// Soft wall-clock limit per callback.
const CALLBACK_TIMEOUT: Duration = Duration::from_millis(500);
/// Deterministic hard ceiling on interpreter operations per callback.
const MAX_OPERATIONS: u64 = 5_000_000;
/// Strategy log ring capacity.
const LOG_CAPACITY: usize = 200;

/// Values returned by the script's `settings()` function.
#[derive(Debug, Clone, Default)]
pub struct ScriptSettings {
    pub interval: Option<String>,
    pub params: std::collections::BTreeMap<String, String>,
}

#[derive(Default)]
struct Series {
    open: Vec<f64>,
    high: Vec<f64>,
    low: Vec<f64>,
    close: Vec<f64>,
    volume: Vec<f64>,
}

pub struct ScriptHost {
    engine: Engine,
    ast: AST,
    name: String,
    symbol: String,
    /// Persistent per-instance state, bound as `this` for every callback.
    state: Dynamic,
    series: Arc<Mutex<Series>>,
    outbox: Arc<Mutex<Vec<OrderIntent>>>,
    logs: Arc<Mutex<VecDeque<String>>>,
    position: Arc<Mutex<Option<Position>>>,
    balances: Arc<Mutex<Vec<Balance>>>,
    deadline: Arc<Mutex<Option<Instant>>>,
    has_on_kline: bool,
    has_on_orderbook: bool,
    has_on_ticker: bool,
}

fn to_f64_vec(values: &Array) -> Vec<f64> {
    values
        .iter()
        .map(|v| {
            v.as_float()
                .or_else(|_| v.as_int().map(|i| i as f64))
                .unwrap_or(f64::NAN)
        })
        .collect()
}

fn from_f64_vec(values: Vec<f64>) -> Array {
    values.into_iter().map(Dynamic::from_float).collect()
}

fn series_map(entries: Vec<(&str, Vec<f64>)>) -> Map {
    let mut map = Map::new();
    for (key, values) in entries {
        map.insert(key.into(), Dynamic::from_array(from_f64_vec(values)));
    }
    map
}

fn dynamic_to_string(value: &Dynamic) -> Option<String> {
    value.clone().into_string().ok().map(|s| s.to_string())
}

fn dynamic_to_decimal(value: &Dynamic) -> Option<Decimal> {
    if let Ok(f) = value.as_float() {
        Decimal::from_f64_retain(f)
    } else if let Ok(i) = value.as_int() {
        Some(Decimal::from(i))
    } else {
        None
    }
}

fn decimal_to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(f64::NAN)
}

/// Build an order intent from script-provided parts. `hold` yields `None`.
fn intent_from_parts(
    symbol: &str,
    action: &str,
    quantity: Option<Decimal>,
    opts: &Map,
) -> Result<Option<OrderIntent>, CoreError> {
    let side = match action.to_ascii_lowercase().as_str() {
        "buy" => OrderSide::Buy,
        "sell" => OrderSide::Sell,
        "hold" => return Ok(None),
        other => {
            return Err(CoreError::Validation(format!(
                "unknown signal action '{}'",
                other
            )));
        }
    };
    let quantity = quantity.ok_or_else(|| {
        CoreError::Validation("signal is missing a numeric quantity".to_string())
    })?;

    let opt_decimal = |key: &str| opts.get(key).and_then(dynamic_to_decimal);
    let order_type = match opts.get("type").and_then(dynamic_to_string) {
        Some(raw) => raw.parse::<OrderType>()?,
        None => OrderType::Market,
    };
    let reason = opts
        .get("reason")
        .and_then(dynamic_to_string)
        .unwrap_or_default();
    // Rebalancer scripts target arbitrary symbols via opts.
    let symbol = opts
        .get("symbol")
        .and_then(dynamic_to_string)
        .unwrap_or_else(|| symbol.to_string());

    Ok(Some(OrderIntent {
        symbol,
        side,
        order_type,
        quantity,
        limit_price: opt_decimal("price"),
        stop_price: opt_decimal("stop_price"),
        trail_amount: opt_decimal("trail_amount"),
        trail_percent: opt_decimal("trail_percent"),
        time_in_force: None,
        reason,
    }))
}

fn kline_to_map(kline: &Kline) -> Map {
    let mut map = Map::new();
    map.insert("symbol".into(), kline.symbol.clone().into());
    map.insert("interval".into(), kline.interval.to_string().into());
    map.insert(
        "open_time".into(),
        Dynamic::from_int(kline.open_time.timestamp_millis()),
    );
    map.insert("open".into(), Dynamic::from_float(decimal_to_f64(kline.open)));
    map.insert("high".into(), Dynamic::from_float(decimal_to_f64(kline.high)));
    map.insert("low".into(), Dynamic::from_float(decimal_to_f64(kline.low)));
    map.insert("close".into(), Dynamic::from_float(decimal_to_f64(kline.close)));
    map.insert(
        "volume".into(),
        Dynamic::from_float(decimal_to_f64(kline.volume)),
    );
    map.insert("closed".into(), kline.closed.into());
    map
}

fn book_to_map(book: &OrderBookSnapshot) -> Map {
    let level_array = |levels: &[crate::domain::market::BookLevel]| -> Array {
        levels
            .iter()
            .map(|l| {
                let mut entry = Map::new();
                entry.insert("price".into(), Dynamic::from_float(decimal_to_f64(l.price)));
                entry.insert(
                    "quantity".into(),
                    Dynamic::from_float(decimal_to_f64(l.quantity)),
                );
                Dynamic::from_map(entry)
            })
            .collect()
    };
    let mut map = Map::new();
    map.insert("symbol".into(), book.symbol.clone().into());
    map.insert(
        "timestamp".into(),
        Dynamic::from_int(book.timestamp.timestamp_millis()),
    );
    map.insert("bids".into(), Dynamic::from_array(level_array(&book.bids)));
    map.insert("asks".into(), Dynamic::from_array(level_array(&book.asks)));
    map.insert(
        "mid_price".into(),
        match book.mid_price() {
            Some(mid) => Dynamic::from_float(decimal_to_f64(mid)),
            None => Dynamic::UNIT,
        },
    );
    map
}

fn ticker_to_map(ticker: &Ticker) -> Map {
    let mut map = Map::new();
    map.insert("symbol".into(), ticker.symbol.clone().into());
    map.insert("price".into(), Dynamic::from_float(decimal_to_f64(ticker.price)));
    map.insert(
        "volume_24h".into(),
        Dynamic::from_float(decimal_to_f64(ticker.volume_24h)),
    );
    map.insert(
        "change".into(),
        Dynamic::from_float(decimal_to_f64(ticker.change)),
    );
    map.insert(
        "change_percent".into(),
        Dynamic::from_float(decimal_to_f64(ticker.change_percent)),
    );
    map.insert(
        "timestamp".into(),
        Dynamic::from_int(ticker.timestamp.timestamp_millis()),
    );
    map
}

impl ScriptHost {
    pub fn load(name: &str, symbol: &str, source: &str) -> Result<ScriptHost, CoreError> {
        let series = Arc::new(Mutex::new(Series::default()));
        let outbox: Arc<Mutex<Vec<OrderIntent>>> = Arc::new(Mutex::new(Vec::new()));
        let logs: Arc<Mutex<VecDeque<String>>> = Arc::new(Mutex::new(VecDeque::new()));
        let position: Arc<Mutex<Option<Position>>> = Arc::new(Mutex::new(None));
        let balances: Arc<Mutex<Vec<Balance>>> = Arc::new(Mutex::new(Vec::new()));
        let deadline: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));

        let mut engine = Engine::new_raw();
        CorePackage::new().register_into_engine(&mut engine);
        BasicArrayPackage::new().register_into_engine(&mut engine);
        BasicMapPackage::new().register_into_engine(&mut engine);
        BasicMathPackage::new().register_into_engine(&mut engine);
        MoreStringPackage::new().register_into_engine(&mut engine);

        engine.set_max_call_levels(64);
        engine.set_max_expr_depths(64, 64);
        engine.set_max_operations(MAX_OPERATIONS);
        engine.set_max_array_size(100_000);
        engine.set_max_map_size(10_000);
        engine.set_max_string_size(64 * 1024);

        {
            let deadline = deadline.clone();
            engine.on_progress(move |ops| {
                if ops & 0x3FF == 0
                    && let Some(limit) = *deadline.lock().expect("deadline lock")
                    && Instant::now() > limit
                {
                    return Some("callback deadline exceeded".into());
                }
                None
            });
        }

        register_series(&mut engine, &series);
        register_indicators(&mut engine);
        register_host_calls(
            &mut engine,
            name,
            symbol,
            &outbox,
            &logs,
            &position,
            &balances,
        );

        let ast = engine.compile(source).map_err(|e| CoreError::Script {
            strategy: name.to_string(),
            message: format!("compile error: {}", e),
        })?;

        let has = |fn_name: &str| ast.iter_functions().any(|f| f.name == fn_name);
        let host = ScriptHost {
            has_on_kline: has("on_kline"),
            has_on_orderbook: has("on_orderbook"),
            has_on_ticker: has("on_ticker"),
            engine,
            ast,
            name: name.to_string(),
            symbol: symbol.to_string(),
            state: Dynamic::from_map(Map::new()),
            series,
            outbox,
            logs,
            position,
            balances,
            deadline,
        };
        Ok(host)
    }

    pub fn has_on_kline(&self) -> bool {
        self.has_on_kline
    }

    pub fn has_on_orderbook(&self) -> bool {
        self.has_on_orderbook
    }

    pub fn has_on_ticker(&self) -> bool {
        self.has_on_ticker
    }

    /// Read `settings()` from the script; absent keys fall back to defaults.
    pub fn settings(&mut self) -> Result<ScriptSettings, CoreError> {
        if !self.ast.iter_functions().any(|f| f.name == "settings") {
            return Ok(ScriptSettings::default());
        }
        let map = self.call::<Map>("settings", ())?;
        let mut settings = ScriptSettings::default();
        for (key, value) in map {
            let rendered = if value.is_string() {
                dynamic_to_string(&value).unwrap_or_default()
            } else {
                value.to_string()
            };
            if key == "interval" {
                settings.interval = Some(rendered);
            } else {
                settings.params.insert(key.to_string(), rendered);
            }
        }
        Ok(settings)
    }

    /// Replace the series snapshot the accessor functions read from.
    pub fn update_series(
        &self,
        open: Vec<f64>,
        high: Vec<f64>,
        low: Vec<f64>,
        close: Vec<f64>,
        volume: Vec<f64>,
    ) {
        let mut series = self.series.lock().expect("series lock");
        *series = Series {
            open,
            high,
            low,
            close,
            volume,
        };
    }

    pub fn set_position(&self, position: Option<Position>) {
        *self.position.lock().expect("position lock") = position;
    }

    pub fn set_balances(&self, balances: Vec<Balance>) {
        *self.balances.lock().expect("balances lock") = balances;
    }

    pub fn on_kline(&mut self, kline: &Kline) -> Result<Vec<OrderIntent>, CoreError> {
        if !self.has_on_kline {
            return Ok(Vec::new());
        }
        self.invoke("on_kline", (kline_to_map(kline),))
    }

    pub fn on_orderbook(&mut self, book: &OrderBookSnapshot) -> Result<Vec<OrderIntent>, CoreError> {
        if !self.has_on_orderbook {
            return Ok(Vec::new());
        }
        self.invoke("on_orderbook", (book_to_map(book),))
    }

    pub fn on_ticker(&mut self, ticker: &Ticker) -> Result<Vec<OrderIntent>, CoreError> {
        if !self.has_on_ticker {
            return Ok(Vec::new());
        }
        self.invoke("on_ticker", (ticker_to_map(ticker),))
    }

    /// Rebalancer entry point. The callback receives the current balances
    /// and a symbol→price map and returns an array of intent maps (or
    /// emits through `signal`).
    pub fn on_rebalance(
        &mut self,
        prices: &std::collections::BTreeMap<String, Decimal>,
    ) -> Result<Vec<OrderIntent>, CoreError> {
        if !self.ast.iter_functions().any(|f| f.name == "on_rebalance") {
            return Ok(Vec::new());
        }
        let balances_arg: Array = self
            .balances
            .lock()
            .expect("balances lock")
            .iter()
            .map(|b| {
                let mut map = Map::new();
                map.insert("asset".into(), b.asset.clone().into());
                map.insert(
                    "available".into(),
                    Dynamic::from_float(decimal_to_f64(b.available)),
                );
                map.insert("locked".into(), Dynamic::from_float(decimal_to_f64(b.locked)));
                map.insert("total".into(), Dynamic::from_float(decimal_to_f64(b.total())));
                Dynamic::from_map(map)
            })
            .collect();
        let mut prices_arg = Map::new();
        for (symbol, price) in prices {
            prices_arg.insert(
                symbol.as_str().into(),
                Dynamic::from_float(decimal_to_f64(*price)),
            );
        }
        self.invoke("on_rebalance", (balances_arg, prices_arg))
    }

    pub fn drain_logs(&self) -> Vec<String> {
        self.logs.lock().expect("logs lock").iter().cloned().collect()
    }

    pub fn push_log(&self, message: String) {
        let mut logs = self.logs.lock().expect("logs lock");
        if logs.len() >= LOG_CAPACITY {
            logs.pop_front();
        }
        logs.push_back(message);
    }

    fn invoke(
        &mut self,
        fn_name: &str,
        args: impl rhai::FuncArgs,
    ) -> Result<Vec<OrderIntent>, CoreError> {
        self.outbox.lock().expect("outbox lock").clear();
        let returned: Dynamic = self.call(fn_name, args)?;

        let mut intents: Vec<OrderIntent> =
            std::mem::take(&mut *self.outbox.lock().expect("outbox lock"));

        // A callback may also return an intent map (or an array of them)
        // instead of calling signal().
        let mut collect_map = |value: Dynamic| -> Result<(), CoreError> {
            if value.is_map() {
                let map = value.cast::<Map>();
                if let Some(action) = map.get("action").and_then(dynamic_to_string) {
                    let quantity = map.get("quantity").and_then(dynamic_to_decimal);
                    if let Some(intent) = intent_from_parts(&self.symbol, &action, quantity, &map)?
                    {
                        intents.push(intent);
                    }
                }
            }
            Ok(())
        };
        if returned.is_array() {
            for value in returned.cast::<Array>() {
                collect_map(value)?;
            }
        } else {
            collect_map(returned)?;
        }
        Ok(intents)
    }

    fn call<T: rhai::Variant + Clone>(
        &mut self,
        fn_name: &str,
        args: impl rhai::FuncArgs,
    ) -> Result<T, CoreError> {
        *self.deadline.lock().expect("deadline lock") = Some(Instant::now() + CALLBACK_TIMEOUT);
        let options = CallFnOptions::new()
            .eval_ast(false)
            .rewind_scope(true)
            .bind_this_ptr(&mut self.state);
        let mut scope = Scope::new();
        let result =
            self.engine
                .call_fn_with_options::<T>(options, &mut scope, &self.ast, fn_name, args);
        *self.deadline.lock().expect("deadline lock") = None;

        result.map_err(|err| match *err {
            EvalAltResult::ErrorTerminated(..) => CoreError::Script {
                strategy: self.name.clone(),
                message: format!("{} exceeded the {:?} deadline", fn_name, CALLBACK_TIMEOUT),
            },
            other => CoreError::Script {
                strategy: self.name.clone(),
                message: other.to_string(),
            },
        })
    }
}

fn register_series(engine: &mut Engine, series: &Arc<Mutex<Series>>) {
    macro_rules! accessor {
        ($name:literal, $field:ident) => {{
            let series = series.clone();
            engine.register_fn($name, move || -> Array {
                from_f64_vec(series.lock().expect("series lock").$field.clone())
            });
        }};
    }
    accessor!("opens", open);
    accessor!("highs", high);
    accessor!("lows", low);
    accessor!("closes", close);
    accessor!("volumes", volume);
}

fn register_host_calls(
    engine: &mut Engine,
    name: &str,
    symbol: &str,
    outbox: &Arc<Mutex<Vec<OrderIntent>>>,
    logs: &Arc<Mutex<VecDeque<String>>>,
    position: &Arc<Mutex<Option<Position>>>,
    balances: &Arc<Mutex<Vec<Balance>>>,
) {
    {
        let logs = logs.clone();
        let strategy = name.to_string();
        engine.register_fn("log", move |message: &str| {
            info!(strategy = %strategy, "{}", message);
            let mut logs = logs.lock().expect("logs lock");
            if logs.len() >= LOG_CAPACITY {
                logs.pop_front();
            }
            logs.push_back(message.to_string());
        });
    }

    let emit = {
        let outbox = outbox.clone();
        let symbol = symbol.to_string();
        move |action: &str, quantity: Dynamic, opts: Map| -> Result<(), Box<EvalAltResult>> {
            let quantity = dynamic_to_decimal(&quantity);
            match intent_from_parts(&symbol, action, quantity, &opts) {
                Ok(Some(intent)) => {
                    outbox.lock().expect("outbox lock").push(intent);
                    Ok(())
                }
                Ok(None) => Ok(()),
                Err(err) => Err(err.to_string().into()),
            }
        }
    };
    {
        let emit = emit.clone();
        engine.register_fn(
            "signal",
            move |action: &str, quantity: Dynamic| -> Result<(), Box<EvalAltResult>> {
                emit(action, quantity, Map::new())
            },
        );
    }
    engine.register_fn(
        "signal",
        move |action: &str, quantity: Dynamic, opts: Map| -> Result<(), Box<EvalAltResult>> {
            emit(action, quantity, opts)
        },
    );

    {
        let position = position.clone();
        engine.register_fn("position", move || -> Map {
            let mut map = Map::new();
            if let Some(p) = position.lock().expect("position lock").as_ref() {
                map.insert("quantity".into(), Dynamic::from_float(decimal_to_f64(p.quantity)));
                map.insert(
                    "average_price".into(),
                    Dynamic::from_float(decimal_to_f64(p.average_price)),
                );
                map.insert(
                    "current_price".into(),
                    Dynamic::from_float(decimal_to_f64(p.current_price)),
                );
                map.insert(
                    "unrealized_pnl".into(),
                    Dynamic::from_float(decimal_to_f64(p.unrealized_pnl)),
                );
            }
            map
        });
    }

    {
        let balances = balances.clone();
        engine.register_fn("balances", move || -> Array {
            balances
                .lock()
                .expect("balances lock")
                .iter()
                .map(|b| {
                    let mut map = Map::new();
                    map.insert("asset".into(), b.asset.clone().into());
                    map.insert(
                        "available".into(),
                        Dynamic::from_float(decimal_to_f64(b.available)),
                    );
                    map.insert("locked".into(), Dynamic::from_float(decimal_to_f64(b.locked)));
                    map.insert("total".into(), Dynamic::from_float(decimal_to_f64(b.total())));
                    Dynamic::from_map(map)
                })
                .collect()
        });
    }
}

fn register_indicators(engine: &mut Engine) {
    engine.register_fn("sma", |values: Array, period: i64| -> Array {
        from_f64_vec(indicators::sma(&to_f64_vec(&values), period.max(0) as usize))
    });
    engine.register_fn("ema", |values: Array, period: i64| -> Array {
        from_f64_vec(indicators::ema(&to_f64_vec(&values), period.max(0) as usize))
    });
    engine.register_fn("wma", |values: Array, period: i64| -> Array {
        from_f64_vec(indicators::wma(&to_f64_vec(&values), period.max(0) as usize))
    });
    engine.register_fn("rsi", |values: Array, period: i64| -> Array {
        from_f64_vec(indicators::rsi(&to_f64_vec(&values), period.max(0) as usize))
    });
    engine.register_fn("roc", |values: Array, period: i64| -> Array {
        from_f64_vec(indicators::roc(&to_f64_vec(&values), period.max(0) as usize))
    });
    engine.register_fn(
        "macd",
        |values: Array, fast: i64, slow: i64, signal: i64| -> Map {
            let (line, signal_line, histogram) = indicators::macd(
                &to_f64_vec(&values),
                fast.max(0) as usize,
                slow.max(0) as usize,
                signal.max(0) as usize,
            );
            series_map(vec![
                ("macd", line),
                ("signal", signal_line),
                ("histogram", histogram),
            ])
        },
    );
    engine.register_fn(
        "bollinger",
        |values: Array, period: i64, k: f64| -> Map {
            let (upper, middle, lower) =
                indicators::bollinger(&to_f64_vec(&values), period.max(0) as usize, k);
            series_map(vec![("upper", upper), ("middle", middle), ("lower", lower)])
        },
    );
    engine.register_fn("percent_b", |values: Array, period: i64, k: f64| -> Array {
        from_f64_vec(indicators::percent_b(&to_f64_vec(&values), period.max(0) as usize, k))
    });
    engine.register_fn("bandwidth", |values: Array, period: i64, k: f64| -> Array {
        from_f64_vec(indicators::bandwidth(&to_f64_vec(&values), period.max(0) as usize, k))
    });
    engine.register_fn(
        "stochastic",
        |high: Array, low: Array, close: Array, k_period: i64, d_period: i64| -> Map {
            let (k, d) = indicators::stochastic(
                &to_f64_vec(&high),
                &to_f64_vec(&low),
                &to_f64_vec(&close),
                k_period.max(0) as usize,
                d_period.max(0) as usize,
            );
            series_map(vec![("k", k), ("d", d)])
        },
    );
    engine.register_fn(
        "williams_r",
        |high: Array, low: Array, close: Array, period: i64| -> Array {
            from_f64_vec(indicators::williams_r(
                &to_f64_vec(&high),
                &to_f64_vec(&low),
                &to_f64_vec(&close),
                period.max(0) as usize,
            ))
        },
    );
    engine.register_fn(
        "atr",
        |high: Array, low: Array, close: Array, period: i64| -> Array {
            from_f64_vec(indicators::atr(
                &to_f64_vec(&high),
                &to_f64_vec(&low),
                &to_f64_vec(&close),
                period.max(0) as usize,
            ))
        },
    );
    engine.register_fn(
        "cci",
        |high: Array, low: Array, close: Array, period: i64| -> Array {
            from_f64_vec(indicators::cci(
                &to_f64_vec(&high),
                &to_f64_vec(&low),
                &to_f64_vec(&close),
                period.max(0) as usize,
            ))
        },
    );
    engine.register_fn(
        "vwap",
        |high: Array, low: Array, close: Array, volume: Array| -> Array {
            from_f64_vec(indicators::vwap(
                &to_f64_vec(&high),
                &to_f64_vec(&low),
                &to_f64_vec(&close),
                &to_f64_vec(&volume),
            ))
        },
    );
    engine.register_fn(
        "mfi",
        |high: Array, low: Array, close: Array, volume: Array, period: i64| -> Array {
            from_f64_vec(indicators::mfi(
                &to_f64_vec(&high),
                &to_f64_vec(&low),
                &to_f64_vec(&close),
                &to_f64_vec(&volume),
                period.max(0) as usize,
            ))
        },
    );
    engine.register_fn("obv", |close: Array, volume: Array| -> Array {
        from_f64_vec(indicators::obv(&to_f64_vec(&close), &to_f64_vec(&volume)))
    });
    engine.register_fn(
        "adx",
        |high: Array, low: Array, close: Array, period: i64| -> Map {
            let (adx, plus_di, minus_di) = indicators::adx(
                &to_f64_vec(&high),
                &to_f64_vec(&low),
                &to_f64_vec(&close),
                period.max(0) as usize,
            );
            series_map(vec![
                ("adx", adx),
                ("plus_di", plus_di),
                ("minus_di", minus_di),
            ])
        },
    );
    engine.register_fn(
        "parabolic_sar",
        |high: Array, low: Array, af_step: f64, af_max: f64| -> Array {
            from_f64_vec(indicators::parabolic_sar(
                &to_f64_vec(&high),
                &to_f64_vec(&low),
                af_step,
                af_max,
            ))
        },
    );
    engine.register_fn(
        "keltner",
        |high: Array, low: Array, close: Array, period: i64, multiplier: f64| -> Map {
            let (upper, middle, lower) = indicators::keltner(
                &to_f64_vec(&high),
                &to_f64_vec(&low),
                &to_f64_vec(&close),
                period.max(0) as usize,
                multiplier,
            );
            series_map(vec![("upper", upper), ("middle", middle), ("lower", lower)])
        },
    );
    engine.register_fn(
        "ichimoku",
        |high: Array, low: Array, close: Array, tenkan: i64, kijun: i64, senkou_b: i64| -> Map {
            let (t, k, a, b, chikou) = indicators::ichimoku(
                &to_f64_vec(&high),
                &to_f64_vec(&low),
                &to_f64_vec(&close),
                tenkan.max(0) as usize,
                kijun.max(0) as usize,
                senkou_b.max(0) as usize,
            );
            series_map(vec![
                ("tenkan", t),
                ("kijun", k),
                ("senkou_a", a),
                ("senkou_b", b),
                ("chikou", chikou),
            ])
        },
    );
    engine.register_fn(
        "pivot_points",
        |high: Array, low: Array, close: Array| -> Map {
            let (pivot, r1, r2, r3, s1, s2, s3) = indicators::pivot_points(
                &to_f64_vec(&high),
                &to_f64_vec(&low),
                &to_f64_vec(&close),
            );
            series_map(vec![
                ("pivot", pivot),
                ("r1", r1),
                ("r2", r2),
                ("r3", r3),
                ("s1", s1),
                ("s2", s2),
                ("s3", s3),
            ])
        },
    );
    engine.register_fn("fibonacci", |swing_high: f64, swing_low: f64| -> Array {
        from_f64_vec(indicators::fibonacci_retracement(swing_high, swing_low))
    });
    engine.register_fn("aroon", |high: Array, low: Array, period: i64| -> Map {
        let (up, down) = indicators::aroon(
            &to_f64_vec(&high),
            &to_f64_vec(&low),
            period.max(0) as usize,
        );
        series_map(vec![("up", up), ("down", down)])
    });
    engine.register_fn("zigzag", |values: Array, threshold_pct: f64| -> Array {
        from_f64_vec(indicators::zigzag(&to_f64_vec(&values), threshold_pct))
    });
    engine.register_fn("percentile_rank", |values: Array, period: i64| -> Array {
        from_f64_vec(indicators::percentile_rank(
            &to_f64_vec(&values),
            period.max(0) as usize,
        ))
    });
    engine.register_fn("linreg", |values: Array, period: i64| -> Map {
        let (slope, intercept, r_squared) =
            indicators::linreg(&to_f64_vec(&values), period.max(0) as usize);
        series_map(vec![
            ("slope", slope),
            ("intercept", intercept),
            ("r_squared", r_squared),
        ])
    });
    engine.register_fn("efficiency_ratio", |values: Array, period: i64| -> Array {
        from_f64_vec(indicators::efficiency_ratio(
            &to_f64_vec(&values),
            period.max(0) as usize,
        ))
    });
    engine.register_fn(
        "mass_index",
        |high: Array, low: Array, ema_period: i64, sum_period: i64| -> Array {
            from_f64_vec(indicators::mass_index(
                &to_f64_vec(&high),
                &to_f64_vec(&low),
                ema_period.max(0) as usize,
                sum_period.max(0) as usize,
            ))
        },
    );
    engine.register_fn(
        "coppock",
        |values: Array, roc_long: i64, roc_short: i64, wma_period: i64| -> Array {
            from_f64_vec(indicators::coppock(
                &to_f64_vec(&values),
                roc_long.max(0) as usize,
                roc_short.max(0) as usize,
                wma_period.max(0) as usize,
            ))
        },
    );
    engine.register_fn(
        "choppiness",
        |high: Array, low: Array, close: Array, period: i64| -> Array {
            from_f64_vec(indicators::choppiness(
                &to_f64_vec(&high),
                &to_f64_vec(&low),
                &to_f64_vec(&close),
                period.max(0) as usize,
            ))
        },
    );
    engine.register_fn("standard_error", |values: Array, period: i64| -> Array {
        from_f64_vec(indicators::standard_error(
            &to_f64_vec(&values),
            period.max(0) as usize,
        ))
    });
    engine.register_fn(
        "rvi",
        |open: Array, high: Array, low: Array, close: Array, period: i64| -> Array {
            from_f64_vec(indicators::rvi(
                &to_f64_vec(&open),
                &to_f64_vec(&high),
                &to_f64_vec(&low),
                &to_f64_vec(&close),
                period.max(0) as usize,
            ))
        },
    );
    engine.register_fn("ppo", |values: Array, fast: i64, slow: i64| -> Array {
        from_f64_vec(indicators::ppo(
            &to_f64_vec(&values),
            fast.max(0) as usize,
            slow.max(0) as usize,
        ))
    });
    engine.register_fn(
        "ad_line",
        |high: Array, low: Array, close: Array, volume: Array| -> Array {
            from_f64_vec(indicators::ad_line(
                &to_f64_vec(&high),
                &to_f64_vec(&low),
                &to_f64_vec(&close),
                &to_f64_vec(&volume),
            ))
        },
    );
    engine.register_fn(
        "chaikin_money_flow",
        |high: Array, low: Array, close: Array, volume: Array, period: i64| -> Array {
            from_f64_vec(indicators::chaikin_money_flow(
                &to_f64_vec(&high),
                &to_f64_vec(&low),
                &to_f64_vec(&close),
                &to_f64_vec(&volume),
                period.max(0) as usize,
            ))
        },
    );
    engine.register_fn(
        "williams_ad",
        |high: Array, low: Array, close: Array| -> Array {
            from_f64_vec(indicators::williams_ad(
                &to_f64_vec(&high),
                &to_f64_vec(&low),
                &to_f64_vec(&close),
            ))
        },
    );
    engine.register_fn(
        "money_flow_volume",
        |high: Array, low: Array, close: Array, volume: Array| -> Array {
            from_f64_vec(indicators::money_flow_volume(
                &to_f64_vec(&high),
                &to_f64_vec(&low),
                &to_f64_vec(&close),
                &to_f64_vec(&volume),
            ))
        },
    );
    engine.register_fn(
        "correlation",
        |a: Array, b: Array, period: i64| -> Array {
            from_f64_vec(indicators::correlation(
                &to_f64_vec(&a),
                &to_f64_vec(&b),
                period.max(0) as usize,
            ))
        },
    );
    engine.register_fn("volatility_index", |values: Array, period: i64| -> Array {
        from_f64_vec(indicators::volatility_index(
            &to_f64_vec(&values),
            period.max(0) as usize,
        ))
    });
    engine.register_fn("highest", |values: Array, period: i64| -> Array {
        from_f64_vec(indicators::highest(&to_f64_vec(&values), period.max(0) as usize))
    });
    engine.register_fn("lowest", |values: Array, period: i64| -> Array {
        from_f64_vec(indicators::lowest(&to_f64_vec(&values), period.max(0) as usize))
    });
    engine.register_fn("crossover", |a: Array, b: Array| -> bool {
        indicators::crossover(&to_f64_vec(&a), &to_f64_vec(&b))
    });
    engine.register_fn("crossunder", |a: Array, b: Array| -> bool {
        indicators::crossunder(&to_f64_vec(&a), &to_f64_vec(&b))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::Interval;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn kline(minute: u32, close: f64) -> Kline {
        let d = Decimal::from_f64_retain(close).unwrap();
        Kline {
            symbol: "BTCUSDT".to_string(),
            interval: Interval::M1,
            open_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap(),
            open: d,
            high: d,
            low: d,
            close: d,
            volume: Decimal::ONE,
            closed: true,
        }
    }

    fn feed(host: &mut ScriptHost, closes: &[f64]) -> Vec<(usize, Vec<OrderIntent>)> {
        let mut emitted = Vec::new();
        let mut series: Vec<f64> = Vec::new();
        for (i, close) in closes.iter().enumerate() {
            series.push(*close);
            host.update_series(
                series.clone(),
                series.clone(),
                series.clone(),
                series.clone(),
                vec![1.0; series.len()],
            );
            let intents = host.on_kline(&kline(i as u32, *close)).unwrap();
            if !intents.is_empty() {
                emitted.push((i, intents));
            }
        }
        emitted
    }

    /// Golden-cross entry with a confirmation threshold and a one-shot
    /// position flag, the shape user strategies typically take.
    const CROSSOVER_SCRIPT: &str = r#"
        fn settings() {
            #{ interval: "1m", position_size: 1.0 }
        }

        fn on_kline(kline) {
            let fast = sma(closes(), 3);
            let slow = sma(closes(), 5);
            let n = fast.len();
            if n == 0 { return; }
            let f = fast[n - 1];
            let s = slow[n - 1];
            if f != f || s != s { return; }
            if f > s * 1.05 && !("long" in this) {
                this.long = true;
                signal("buy", 1.0, #{ type: "market", reason: "golden cross" });
            }
        }
    "#;

    #[test]
    fn settings_are_read_from_the_script() {
        let mut host = ScriptHost::load("crossover", "BTCUSDT", CROSSOVER_SCRIPT).unwrap();
        let settings = host.settings().unwrap();
        assert_eq!(settings.interval.as_deref(), Some("1m"));
        assert_eq!(settings.params.get("position_size").map(String::as_str), Some("1.0"));
    }

    #[test]
    fn golden_cross_emits_exactly_one_buy() {
        let mut host = ScriptHost::load("crossover", "BTCUSDT", CROSSOVER_SCRIPT).unwrap();
        let closes = [10.0, 10.0, 10.0, 10.0, 10.0, 11.0, 12.0, 13.0, 14.0, 15.0];
        let emitted = feed(&mut host, &closes);
        assert_eq!(emitted.len(), 1, "expected exactly one signal");
        let (index, intents) = &emitted[0];
        // SMA3 first clears SMA5 by the confirmation margin on bar 7
        // (12 > 11.2 * 1.05).
        assert_eq!(*index, 7);
        assert_eq!(intents.len(), 1);
        let intent = &intents[0];
        assert_eq!(intent.side, OrderSide::Buy);
        assert_eq!(intent.order_type, OrderType::Market);
        assert_eq!(intent.quantity, dec!(1));
    }

    #[test]
    fn state_persists_across_invocations() {
        let script = r#"
            fn on_kline(kline) {
                if "count" in this {
                    this.count += 1;
                } else {
                    this.count = 1;
                }
                if this.count == 3 {
                    signal("buy", 2.0);
                }
            }
        "#;
        let mut host = ScriptHost::load("counter", "BTCUSDT", script).unwrap();
        let emitted = feed(&mut host, &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].0, 2);
        assert_eq!(emitted[0].1[0].quantity, dec!(2));
    }

    #[test]
    fn returned_intent_map_is_collected() {
        let script = r#"
            fn on_kline(kline) {
                #{ action: "sell", quantity: 0.5, type: "trailing_stop", trail_percent: 2.0,
                   reason: "protect" }
            }
        "#;
        let mut host = ScriptHost::load("returner", "BTCUSDT", script).unwrap();
        let emitted = feed(&mut host, &[1.0]);
        assert_eq!(emitted.len(), 1);
        let intent = &emitted[0].1[0];
        assert_eq!(intent.side, OrderSide::Sell);
        assert_eq!(intent.order_type, OrderType::TrailingStop);
        assert_eq!(intent.trail_percent, Some(dec!(2)));
        assert_eq!(intent.reason, "protect");
    }

    #[test]
    fn hold_action_emits_nothing() {
        let script = r#"
            fn on_kline(kline) {
                #{ action: "hold", quantity: 1.0 }
            }
        "#;
        let mut host = ScriptHost::load("holder", "BTCUSDT", script).unwrap();
        assert!(feed(&mut host, &[1.0, 2.0]).is_empty());
    }

    #[test]
    fn empty_history_indicators_do_not_crash() {
        let script = r#"
            fn on_kline(kline) {
                let r = rsi(closes(), 14);
                let m = macd(closes(), 12, 26, 9);
                if r.len() > 0 { log("has data"); }
            }
        "#;
        let mut host = ScriptHost::load("empty", "BTCUSDT", script).unwrap();
        host.update_series(vec![], vec![], vec![], vec![], vec![]);
        let intents = host.on_kline(&kline(0, 10.0)).unwrap();
        assert!(intents.is_empty());
    }

    #[test]
    fn runaway_script_is_terminated() {
        let script = r#"
            fn on_kline(kline) {
                let x = 0;
                loop { x += 1; }
            }
        "#;
        let mut host = ScriptHost::load("runaway", "BTCUSDT", script).unwrap();
        let err = host.on_kline(&kline(0, 10.0)).unwrap_err();
        assert!(matches!(err, CoreError::Script { .. }));
    }

    #[test]
    fn script_error_is_surfaced_not_fatal() {
        let script = r#"
            fn on_kline(kline) {
                kline.does_not_exist.boom();
            }
        "#;
        let mut host = ScriptHost::load("broken", "BTCUSDT", script).unwrap();
        let err = host.on_kline(&kline(0, 10.0)).unwrap_err();
        assert!(matches!(err, CoreError::Script { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn missing_callbacks_are_noops() {
        let script = r#"
            fn settings() { #{ interval: "1h" } }
        "#;
        let mut host = ScriptHost::load("quiet", "BTCUSDT", script).unwrap();
        assert!(!host.has_on_kline());
        assert!(host.on_kline(&kline(0, 10.0)).unwrap().is_empty());
        assert!(host.on_ticker(&Ticker {
            symbol: "BTCUSDT".to_string(),
            price: dec!(10),
            volume_24h: dec!(0),
            change: dec!(0),
            change_percent: dec!(0),
            index_price: None,
            timestamp: Utc::now(),
        })
        .unwrap()
        .is_empty());
    }

    #[test]
    fn logs_are_ring_buffered() {
        let script = r#"
            fn on_kline(kline) {
                log("bar " + kline.close);
            }
        "#;
        let mut host = ScriptHost::load("logger", "BTCUSDT", script).unwrap();
        feed(&mut host, &[1.0, 2.0]);
        let logs = host.drain_logs();
        assert_eq!(logs.len(), 2);
        assert!(logs[0].starts_with("bar "));
    }
}

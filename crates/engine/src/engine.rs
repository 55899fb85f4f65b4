//! Event-driven backtesting engine
//!
//! Sparse per-token price points are merged onto one global timeline (the
//! sorted union of every token's timestamps). At each global timestamp, every
//! token that printed there gets a bar, in ascending token-id order, and the
//! strategy sees it through a [`BacktestContext`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::debug;

use crate::portfolio::Portfolio;
use crate::strategy::Strategy;
use crate::types::*;

// ============================================================================
// Bar series
// ============================================================================

#[derive(Debug, Clone)]
struct TokenBars {
    token_id: String,
    bars: Vec<Bar>,
}

/// Read-only bar timeline shared by every run over the same dataset
#[derive(Debug, Clone, Default)]
pub struct BarSeries {
    timeline: Vec<i64>,
    tokens: Vec<TokenBars>,
    index: HashMap<String, usize>,
    /// For each timeline slot, the tokens printing there (ascending id order)
    events: Vec<Vec<usize>>,
}

impl BarSeries {
    pub fn build(dataset: &Dataset) -> Self {
        let mut tokens = Vec::with_capacity(dataset.price_history.len());

        // BTreeMap iteration keeps tokens sorted by id
        for (token_id, points) in &dataset.price_history {
            let mut sorted: Vec<&PricePoint> = points.iter().collect();
            sorted.sort_by_key(|p| p.timestamp);

            // Duplicate timestamps: the last observation wins
            let mut bars: Vec<Bar> = Vec::with_capacity(sorted.len());
            for point in sorted {
                match bars.last_mut() {
                    Some(last) if last.timestamp == point.timestamp => {
                        *last = Bar::from_point(token_id, point);
                    }
                    _ => bars.push(Bar::from_point(token_id, point)),
                }
            }

            if !bars.is_empty() {
                tokens.push(TokenBars {
                    token_id: token_id.clone(),
                    bars,
                });
            }
        }

        let mut timeline: Vec<i64> = tokens
            .iter()
            .flat_map(|t| t.bars.iter().map(|b| b.timestamp))
            .collect();
        timeline.sort_unstable();
        timeline.dedup();

        let mut events = vec![Vec::new(); timeline.len()];
        for (idx, token) in tokens.iter().enumerate() {
            for bar in &token.bars {
                if let Ok(slot) = timeline.binary_search(&bar.timestamp) {
                    events[slot].push(idx);
                }
            }
        }

        let index = tokens
            .iter()
            .enumerate()
            .map(|(i, t)| (t.token_id.clone(), i))
            .collect();

        Self {
            timeline,
            tokens,
            index,
            events,
        }
    }

    pub fn timeline(&self) -> &[i64] {
        &self.timeline
    }

    pub fn token_ids(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().map(|t| t.token_id.as_str())
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    pub fn bar_count(&self) -> usize {
        self.tokens.iter().map(|t| t.bars.len()).sum()
    }

    /// All bars of one token
    pub fn bars(&self, token_id: &str) -> Option<&[Bar]> {
        self.index
            .get(token_id)
            .map(|&i| self.tokens[i].bars.as_slice())
    }

    fn revealed(&self, token_idx: usize, cursors: &[usize]) -> &[Bar] {
        &self.tokens[token_idx].bars[..cursors[token_idx]]
    }

    fn latest_price(&self, token_id: &str, cursors: &[usize]) -> Option<Decimal> {
        let idx = *self.index.get(token_id)?;
        self.revealed(idx, cursors).last().map(|b| b.close)
    }
}

// ============================================================================
// Strategy context
// ============================================================================

/// The strategy's view of a running backtest
pub struct BacktestContext<'a> {
    series: &'a BarSeries,
    cursors: &'a [usize],
    portfolio: &'a mut Portfolio,
    equity_curve: &'a mut Vec<EquityPoint>,
    timestamp: i64,
    current: Option<usize>,
}

impl<'a> BacktestContext<'a> {
    /// Buy at the token's latest price
    pub fn buy(&mut self, token_id: &str, size: Decimal) -> OrderResult {
        let Some(price) = self.current_price(token_id) else {
            return OrderResult::rejected(format!("No price for {token_id} yet"));
        };
        let result = self.portfolio.buy(token_id, size, price, self.timestamp);
        if result.success {
            self.record_equity();
        }
        result
    }

    /// Sell at the token's latest price
    pub fn sell(&mut self, token_id: &str, size: Decimal) -> OrderResult {
        let Some(price) = self.current_price(token_id) else {
            return OrderResult::rejected(format!("No price for {token_id} yet"));
        };
        let result = self.portfolio.sell(token_id, size, price, self.timestamp);
        if result.success {
            self.record_equity();
        }
        result
    }

    /// Sell the whole position at the token's latest price
    pub fn close(&mut self, token_id: &str) -> OrderResult {
        let Some(price) = self.current_price(token_id) else {
            return OrderResult::rejected(format!("No price for {token_id} yet"));
        };
        let result = self.portfolio.close(token_id, price, self.timestamp);
        if result.success {
            self.record_equity();
        }
        result
    }

    pub fn capital(&self) -> Decimal {
        self.portfolio.capital()
    }

    pub fn initial_capital(&self) -> Decimal {
        self.portfolio.initial_capital()
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Latest known price of a token, `None` before its first bar
    pub fn current_price(&self, token_id: &str) -> Option<Decimal> {
        self.series.latest_price(token_id, self.cursors)
    }

    /// The bar being processed, `None` inside `on_init` / `on_complete`
    pub fn current_bar(&self) -> Option<&Bar> {
        let idx = self.current?;
        self.series.revealed(idx, self.cursors).last()
    }

    pub fn position(&self, token_id: &str) -> Option<&Position> {
        self.portfolio.position(token_id)
    }

    pub fn positions(&self) -> Vec<&Position> {
        self.portfolio.positions().collect()
    }

    /// A past bar of a token; offset 0 is the most recent one
    pub fn bar(&self, token_id: &str, offset: usize) -> Option<&Bar> {
        let idx = *self.series.index.get(token_id)?;
        let revealed = self.series.revealed(idx, self.cursors);
        revealed.len().checked_sub(offset + 1).map(|i| &revealed[i])
    }

    /// The token's bars so far (oldest first), optionally only the last `length`
    pub fn history(&self, token_id: &str, length: Option<usize>) -> &[Bar] {
        let Some(&idx) = self.series.index.get(token_id) else {
            return &[];
        };
        let revealed = self.series.revealed(idx, self.cursors);
        match length {
            Some(n) if n < revealed.len() => &revealed[revealed.len() - n..],
            _ => revealed,
        }
    }

    pub fn total_value(&self) -> Decimal {
        self.portfolio
            .total_value(|id| self.series.latest_price(id, self.cursors))
    }

    pub fn pnl(&self) -> Decimal {
        self.portfolio
            .pnl(|id| self.series.latest_price(id, self.cursors))
    }

    fn record_equity(&mut self) {
        let equity = self.total_value();
        self.equity_curve.push(EquityPoint {
            time: self.timestamp,
            equity,
        });
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Backtesting engine that replays a bar series through a strategy
pub struct BacktestEngine {
    series: Arc<BarSeries>,
    config: BacktestConfig,
}

impl BacktestEngine {
    pub fn new(dataset: &Dataset, config: BacktestConfig) -> Self {
        Self::with_series(Arc::new(BarSeries::build(dataset)), config)
    }

    /// Reuse an already-built series (the optimizer shares one across runs)
    pub fn with_series(series: Arc<BarSeries>, config: BacktestConfig) -> Self {
        Self { series, config }
    }

    pub fn series(&self) -> &Arc<BarSeries> {
        &self.series
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    /// Run the strategy over the whole timeline
    pub fn run(&self, strategy: &mut dyn Strategy) -> BacktestResult {
        let series = self.series.as_ref();
        let mut portfolio = Portfolio::new(self.config.initial_capital, self.config.fee_model.clone());
        let mut cursors = vec![0usize; series.tokens.len()];
        let mut equity_curve: Vec<EquityPoint> = Vec::new();

        let start_time = series.timeline.first().copied().unwrap_or(0);
        let end_time = series.timeline.last().copied().unwrap_or(0);

        debug!(
            strategy = strategy.name(),
            tokens = series.tokens.len(),
            timestamps = series.timeline.len(),
            capital = %self.config.initial_capital,
            "Starting backtest"
        );

        {
            let mut ctx = BacktestContext {
                series,
                cursors: &cursors,
                portfolio: &mut portfolio,
                equity_curve: &mut equity_curve,
                timestamp: start_time,
                current: None,
            };
            strategy.on_init(&mut ctx);
        }

        let mut bars_processed = 0usize;
        for (slot, &timestamp) in series.timeline.iter().enumerate() {
            for &token_idx in &series.events[slot] {
                cursors[token_idx] += 1;
                bars_processed += 1;
                let bar = &series.tokens[token_idx].bars[cursors[token_idx] - 1];

                let mut ctx = BacktestContext {
                    series,
                    cursors: &cursors,
                    portfolio: &mut portfolio,
                    equity_curve: &mut equity_curve,
                    timestamp,
                    current: Some(token_idx),
                };
                strategy.on_next(&mut ctx, bar);
            }

            portfolio.update_position_values(|id| series.latest_price(id, &cursors));
        }

        {
            let mut ctx = BacktestContext {
                series,
                cursors: &cursors,
                portfolio: &mut portfolio,
                equity_curve: &mut equity_curve,
                timestamp: end_time,
                current: None,
            };
            strategy.on_complete(&mut ctx);
        }

        let result = Self::finalize(
            strategy.name(),
            &portfolio,
            |id| series.latest_price(id, &cursors),
            equity_curve,
            start_time,
            end_time,
            bars_processed,
        );

        debug!(
            strategy = strategy.name(),
            trades = result.total_trades,
            total_return_pct = result.total_return_pct,
            sharpe = result.sharpe_ratio,
            "Backtest complete"
        );

        result
    }

    fn finalize<F>(
        strategy: &str,
        portfolio: &Portfolio,
        final_price: F,
        equity_curve: Vec<EquityPoint>,
        start_time: i64,
        end_time: i64,
        bars_processed: usize,
    ) -> BacktestResult
    where
        F: Fn(&str) -> Option<Decimal>,
    {
        let initial = portfolio.initial_capital();
        let final_capital = portfolio.total_value(&final_price);
        let total_return = final_capital - initial;
        let total_return_pct = if initial > Decimal::ZERO {
            to_f64(total_return / initial) * 100.0
        } else {
            0.0
        };

        let trades = portfolio.trades().to_vec();
        let (winning_trades, losing_trades) = Self::count_round_trips(&trades);
        let closed = winning_trades + losing_trades;
        let win_rate = if closed > 0 {
            winning_trades as f64 / closed as f64 * 100.0
        } else {
            0.0
        };

        let equity: Vec<f64> = equity_curve.iter().map(|p| to_f64(p.equity)).collect();
        let max_drawdown = Self::calculate_max_drawdown(to_f64(initial), &equity);
        let sharpe_ratio = Self::calculate_sharpe(&equity);

        let mut positions: Vec<Position> = portfolio.positions().cloned().collect();
        for position in &mut positions {
            if let Some(price) = final_price(&position.token_id) {
                position.current_value = position.size * price;
                position.pnl = position.current_value - position.size * position.avg_price;
            }
        }

        BacktestResult {
            strategy: strategy.to_string(),
            start_time,
            end_time,
            bars_processed,
            initial_capital: initial,
            final_capital,
            total_return,
            total_return_pct,
            total_trades: trades.len() as u32,
            winning_trades,
            losing_trades,
            win_rate,
            max_drawdown,
            sharpe_ratio,
            total_fees: portfolio.total_fees(),
            positions,
            trades,
            equity_curve,
        }
    }

    /// Each sell is judged against the fee-inclusive average buy cost
    /// accumulated since the token was last flat.
    fn count_round_trips(trades: &[TradeRecord]) -> (u32, u32) {
        let mut cost_basis: BTreeMap<&str, (Decimal, Decimal)> = BTreeMap::new();
        let mut winners = 0u32;
        let mut losers = 0u32;

        for trade in trades {
            match trade.side {
                TradeSide::Buy => {
                    let entry = cost_basis
                        .entry(trade.token_id.as_str())
                        .or_insert((Decimal::ZERO, Decimal::ZERO));
                    entry.0 += trade.total_cost;
                    entry.1 += trade.size;
                }
                TradeSide::Sell => {
                    let avg_cost = match cost_basis.get(trade.token_id.as_str()) {
                        Some((cost, size)) if !size.is_zero() => *cost / *size,
                        _ => Decimal::ZERO,
                    };
                    if trade.price >= avg_cost {
                        winners += 1;
                    } else {
                        losers += 1;
                    }
                    if trade.position_size_after.is_zero() {
                        cost_basis.remove(trade.token_id.as_str());
                    }
                }
            }
        }

        (winners, losers)
    }

    /// Largest peak-to-trough decline in percent; the peak starts at initial capital
    fn calculate_max_drawdown(initial: f64, equity: &[f64]) -> f64 {
        let mut peak = initial;
        let mut max_drawdown = 0.0_f64;
        for &value in equity {
            if value > peak {
                peak = value;
            }
            if peak > 0.0 {
                max_drawdown = max_drawdown.max((peak - value) / peak);
            }
        }
        max_drawdown * 100.0
    }

    /// Annualized (√252) Sharpe of consecutive equity-point returns, population std
    fn calculate_sharpe(equity: &[f64]) -> f64 {
        let returns: Vec<f64> = equity
            .windows(2)
            .filter(|w| w[0] > 0.0)
            .map(|w| (w[1] - w[0]) / w[0])
            .collect();
        if returns.is_empty() {
            return 0.0;
        }

        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
        let std_dev = variance.sqrt();

        if std_dev < 1e-12 {
            return 0.0;
        }
        mean / std_dev * 252f64.sqrt()
    }
}

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fees::FeeModel;
    use rust_decimal_macros::dec;

    fn make_dataset(series: &[(&str, &[(i64, Decimal)])]) -> Dataset {
        let mut dataset = Dataset::default();
        for (token, points) in series {
            dataset.price_history.insert(
                token.to_string(),
                points.iter().map(|&(t, p)| PricePoint::new(t, p)).collect(),
            );
        }
        dataset
    }

    /// Buys a fixed cash amount of every token on its first bar and holds
    struct BuyAndHold {
        cash_per_token: Decimal,
    }

    impl Strategy for BuyAndHold {
        fn name(&self) -> &str {
            "buy_and_hold"
        }

        fn on_next(&mut self, ctx: &mut BacktestContext<'_>, bar: &Bar) {
            if ctx.position(&bar.token_id).is_none() && ctx.history(&bar.token_id, None).len() == 1 {
                let size = self.cash_per_token / bar.close;
                ctx.buy(&bar.token_id, size);
            }
        }
    }

    /// Records what the context exposes at each step
    #[derive(Default)]
    struct Recorder {
        seen: Vec<(i64, String)>,
        init_calls: usize,
        complete_calls: usize,
        last_history_len: HashMap<String, usize>,
        previous_close: Vec<Option<Decimal>>,
    }

    impl Strategy for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn on_init(&mut self, ctx: &mut BacktestContext<'_>) {
            self.init_calls += 1;
            assert!(ctx.current_bar().is_none());
        }

        fn on_next(&mut self, ctx: &mut BacktestContext<'_>, bar: &Bar) {
            assert_eq!(ctx.current_bar(), Some(bar));
            assert_eq!(ctx.timestamp(), bar.timestamp);
            self.seen.push((bar.timestamp, bar.token_id.clone()));
            self.last_history_len
                .insert(bar.token_id.clone(), ctx.history(&bar.token_id, None).len());
            self.previous_close
                .push(ctx.bar(&bar.token_id, 1).map(|b| b.close));
        }

        fn on_complete(&mut self, _ctx: &mut BacktestContext<'_>) {
            self.complete_calls += 1;
        }
    }

    #[test]
    fn test_timeline_is_union_without_forward_fill() {
        let dataset = make_dataset(&[
            ("b", &[(2, dec!(0.5)), (4, dec!(0.6))]),
            ("a", &[(1, dec!(0.1)), (2, dec!(0.2)), (3, dec!(0.3))]),
        ]);
        let engine = BacktestEngine::new(&dataset, BacktestConfig::default());
        assert_eq!(engine.series().timeline(), &[1, 2, 3, 4]);

        let mut recorder = Recorder::default();
        let result = engine.run(&mut recorder);

        assert_eq!(recorder.init_calls, 1);
        assert_eq!(recorder.complete_calls, 1);
        assert_eq!(
            recorder.seen,
            vec![
                (1, "a".to_string()),
                (2, "a".to_string()),
                (2, "b".to_string()),
                (3, "a".to_string()),
                (4, "b".to_string()),
            ]
        );
        assert_eq!(recorder.last_history_len["a"], 3);
        assert_eq!(recorder.last_history_len["b"], 2);
        assert_eq!(recorder.previous_close[2], None);
        assert_eq!(recorder.previous_close[3], Some(dec!(0.2)));
        assert_eq!(result.bars_processed, 5);
    }

    #[test]
    fn test_duplicate_timestamps_keep_last_price() {
        let dataset = make_dataset(&[("a", &[(1, dec!(0.1)), (1, dec!(0.4)), (2, dec!(0.5))])]);
        let series = BarSeries::build(&dataset);
        let bars = series.bars("a").unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].close, dec!(0.4));
    }

    #[test]
    fn test_scenario_offsetting_tokens_break_even() {
        let dataset = make_dataset(&[
            (
                "yes",
                &[(1, dec!(0.40)), (2, dec!(0.45)), (3, dec!(0.50)), (4, dec!(0.45)), (5, dec!(0.40))],
            ),
            (
                "no",
                &[(1, dec!(0.60)), (2, dec!(0.55)), (3, dec!(0.50)), (4, dec!(0.55)), (5, dec!(0.60))],
            ),
        ]);
        let engine = BacktestEngine::new(&dataset, BacktestConfig::default());
        let mut strategy = BuyAndHold {
            cash_per_token: dec!(500),
        };
        let result = engine.run(&mut strategy);

        assert_eq!(result.total_trades, 2);
        assert_eq!(result.winning_trades, 0);
        assert_eq!(result.losing_trades, 0);
        // 500 / 0.60 is not exact in 28 digits
        assert!(result.total_return.abs() < dec!(0.000001));
        assert!(result.total_return_pct.abs() < 1e-6);
        assert_eq!(result.positions.len(), 2);
    }

    #[test]
    fn test_scenario_round_trip_fee_loss() {
        struct BuyThenSell;
        impl Strategy for BuyThenSell {
            fn name(&self) -> &str {
                "buy_then_sell"
            }
            fn on_next(&mut self, ctx: &mut BacktestContext<'_>, bar: &Bar) {
                if ctx.history(&bar.token_id, None).len() == 1 {
                    assert!(ctx.buy(&bar.token_id, dec!(200)).success);
                    assert!(ctx.close(&bar.token_id).success);
                }
            }
        }

        let dataset = make_dataset(&[("a", &[(1, dec!(0.50)), (2, dec!(0.50))])]);
        let config = BacktestConfig {
            fee_model: FeeModel::flat(dec!(0.01)),
            ..Default::default()
        };
        let result = BacktestEngine::new(&dataset, config).run(&mut BuyThenSell);

        assert_eq!(result.trades[0].total_cost, dec!(101));
        assert_eq!(result.trades[1].total_cost, dec!(99));
        assert_eq!(result.total_return, dec!(-2));
        assert_eq!(result.total_trades, 2);
        // 0.50 against a fee-inclusive cost of 0.505
        assert_eq!(result.losing_trades, 1);
        assert!(result.positions.is_empty());
    }

    #[test]
    fn test_order_before_first_print_is_rejected() {
        struct EagerBuyer {
            result: Option<OrderResult>,
        }
        impl Strategy for EagerBuyer {
            fn name(&self) -> &str {
                "eager"
            }
            fn on_next(&mut self, ctx: &mut BacktestContext<'_>, _bar: &Bar) {
                if self.result.is_none() {
                    self.result = Some(ctx.buy("late", dec!(1)));
                }
            }
        }

        let dataset = make_dataset(&[("early", &[(1, dec!(0.5))]), ("late", &[(2, dec!(0.5))])]);
        let mut strategy = EagerBuyer { result: None };
        let result = BacktestEngine::new(&dataset, BacktestConfig::default()).run(&mut strategy);

        let order = strategy.result.unwrap();
        assert!(!order.success);
        assert!(order.error.is_some());
        assert_eq!(result.total_trades, 0);
    }

    #[test]
    fn test_drawdown_and_sharpe_from_trade_equity() {
        // Buy at 0.5, sell half at 0.25, sell the rest at 0.75
        struct Swing;
        impl Strategy for Swing {
            fn name(&self) -> &str {
                "swing"
            }
            fn on_next(&mut self, ctx: &mut BacktestContext<'_>, bar: &Bar) {
                match ctx.history(&bar.token_id, None).len() {
                    1 => {
                        ctx.buy(&bar.token_id, dec!(1000));
                    }
                    2 => {
                        ctx.sell(&bar.token_id, dec!(500));
                    }
                    3 => {
                        ctx.close(&bar.token_id);
                    }
                    _ => {}
                }
            }
        }

        let dataset = make_dataset(&[("a", &[(1, dec!(0.5)), (2, dec!(0.25)), (3, dec!(0.75))])]);
        let result = BacktestEngine::new(&dataset, BacktestConfig::default()).run(&mut Swing);

        let equity: Vec<Decimal> = result.equity_curve.iter().map(|p| p.equity).collect();
        assert_eq!(equity, vec![dec!(1000), dec!(750), dec!(1000)]);
        assert!((result.max_drawdown - 25.0).abs() < 1e-9);
        // Returns -0.25 and +1/3: mean 0.041667, std 0.291667
        let expected = (1.0 / 24.0) / (7.0 / 24.0) * 252f64.sqrt();
        assert!((result.sharpe_ratio - expected).abs() < 1e-9);
        assert_eq!(result.total_return, Decimal::ZERO);
        assert_eq!(result.winning_trades, 1);
        assert_eq!(result.losing_trades, 1);
    }

    #[test]
    fn test_empty_dataset() {
        let engine = BacktestEngine::new(&Dataset::default(), BacktestConfig::default());
        let mut recorder = Recorder::default();
        let result = engine.run(&mut recorder);
        assert_eq!(result.total_trades, 0);
        assert_eq!(result.final_capital, dec!(1000));
        assert_eq!(result.sharpe_ratio, 0.0);
        assert_eq!(recorder.init_calls, 1);
    }

    #[test]
    fn test_runs_are_deterministic() {
        let dataset = make_dataset(&[
            ("a", &[(1, dec!(0.3)), (3, dec!(0.4)), (5, dec!(0.2))]),
            ("b", &[(2, dec!(0.7)), (3, dec!(0.6)), (4, dec!(0.9))]),
        ]);
        let engine = BacktestEngine::new(&dataset, BacktestConfig::default());
        let first = engine.run(&mut BuyAndHold { cash_per_token: dec!(100) });
        let second = engine.run(&mut BuyAndHold { cash_per_token: dec!(100) });
        assert_eq!(first.trades, second.trades);
        assert_eq!(first.final_capital, second.final_capital);
        assert_eq!(first.equity_curve, second.equity_curve);
    }
}

//! Signal generators for the generic strategies
//!
//! Every generator consumes one price per bar and emits Buy/Sell/Hold. The
//! indicator math lives in the `ta` crate; generators only own warm-up
//! bookkeeping and the crossing/threshold rules. Which generator a strategy
//! runs is described by the serializable [`IndicatorConfig`].

use serde::{Deserialize, Serialize};
use ta::indicators::{
    BollingerBands, ExponentialMovingAverage, Maximum, Minimum, RelativeStrengthIndex,
    SimpleMovingAverage,
};
use ta::{Next, Reset};

use crate::error::{EngineError, EngineResult};

// ============================================================================
// Core trait
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

/// Trait for bar-by-bar signal generation
pub trait SignalGenerator: Send {
    fn name(&self) -> &str;
    fn on_price(&mut self, price: f64) -> Signal;
    fn reset(&mut self);
    /// Fresh copy carrying the same configuration and current state
    fn boxed_clone(&self) -> Box<dyn SignalGenerator>;
}

fn indicator_error(what: &str, err: impl std::fmt::Debug) -> EngineError {
    EngineError::Indicator(format!("{what}: {err:?}"))
}

fn require_period(what: &str, period: usize) -> EngineResult<()> {
    if period == 0 {
        return Err(EngineError::Indicator(format!("{what} period must be at least 1")));
    }
    Ok(())
}

// ============================================================================
// 1. Moving-average crossover (SMA or EMA)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaKind {
    Sma,
    Ema,
}

#[derive(Debug, Clone)]
enum MovingAverage {
    Simple(SimpleMovingAverage),
    Exponential(ExponentialMovingAverage),
}

impl MovingAverage {
    fn new(kind: MaKind, period: usize) -> EngineResult<Self> {
        require_period("moving average", period)?;
        Ok(match kind {
            MaKind::Sma => MovingAverage::Simple(
                SimpleMovingAverage::new(period).map_err(|e| indicator_error("SMA", e))?,
            ),
            MaKind::Ema => MovingAverage::Exponential(
                ExponentialMovingAverage::new(period).map_err(|e| indicator_error("EMA", e))?,
            ),
        })
    }

    fn next(&mut self, value: f64) -> f64 {
        match self {
            MovingAverage::Simple(ma) => ma.next(value),
            MovingAverage::Exponential(ma) => ma.next(value),
        }
    }

    fn reset(&mut self) {
        match self {
            MovingAverage::Simple(ma) => ma.reset(),
            MovingAverage::Exponential(ma) => ma.reset(),
        }
    }
}

/// Buy on a golden cross, sell on a death cross
#[derive(Debug, Clone)]
pub struct MaCrossSignalGenerator {
    fast: MovingAverage,
    slow: MovingAverage,
    slow_period: usize,
    prev_fast: f64,
    prev_slow: f64,
    bars_seen: usize,
}

impl MaCrossSignalGenerator {
    pub fn new(kind: MaKind, fast_period: usize, slow_period: usize) -> EngineResult<Self> {
        Ok(Self {
            fast: MovingAverage::new(kind, fast_period)?,
            slow: MovingAverage::new(kind, slow_period)?,
            slow_period,
            prev_fast: 0.0,
            prev_slow: 0.0,
            bars_seen: 0,
        })
    }
}

impl SignalGenerator for MaCrossSignalGenerator {
    fn name(&self) -> &str {
        "MACrossover"
    }

    fn on_price(&mut self, price: f64) -> Signal {
        let fast = self.fast.next(price);
        let slow = self.slow.next(price);
        self.bars_seen += 1;

        let signal = if self.bars_seen <= self.slow_period {
            Signal::Hold
        } else if self.prev_fast <= self.prev_slow && fast > slow {
            Signal::Buy
        } else if self.prev_fast >= self.prev_slow && fast < slow {
            Signal::Sell
        } else {
            Signal::Hold
        };

        self.prev_fast = fast;
        self.prev_slow = slow;
        signal
    }

    fn reset(&mut self) {
        self.fast.reset();
        self.slow.reset();
        self.prev_fast = 0.0;
        self.prev_slow = 0.0;
        self.bars_seen = 0;
    }

    fn boxed_clone(&self) -> Box<dyn SignalGenerator> {
        Box::new(self.clone())
    }
}

// ============================================================================
// 2. RSI thresholds
// ============================================================================

/// Buy below `oversold`, sell above `overbought`
#[derive(Debug, Clone)]
pub struct RsiSignalGenerator {
    rsi: RelativeStrengthIndex,
    period: usize,
    oversold: f64,
    overbought: f64,
    bars_seen: usize,
}

impl RsiSignalGenerator {
    pub fn new(period: usize, oversold: f64, overbought: f64) -> EngineResult<Self> {
        require_period("RSI", period)?;
        Ok(Self {
            rsi: RelativeStrengthIndex::new(period).map_err(|e| indicator_error("RSI", e))?,
            period,
            oversold,
            overbought,
            bars_seen: 0,
        })
    }
}

impl SignalGenerator for RsiSignalGenerator {
    fn name(&self) -> &str {
        "RSI"
    }

    fn on_price(&mut self, price: f64) -> Signal {
        let value = self.rsi.next(price);
        self.bars_seen += 1;

        if self.bars_seen <= self.period {
            Signal::Hold
        } else if value < self.oversold {
            Signal::Buy
        } else if value > self.overbought {
            Signal::Sell
        } else {
            Signal::Hold
        }
    }

    fn reset(&mut self) {
        self.rsi.reset();
        self.bars_seen = 0;
    }

    fn boxed_clone(&self) -> Box<dyn SignalGenerator> {
        Box::new(self.clone())
    }
}

// ============================================================================
// 3. Stochastic oscillator (close-only)
// ============================================================================

/// %K over the last `k_period` prices, %D = SMA(%K, d_period).
///
/// Buy when %K is oversold and above %D, sell when overbought and below %D.
#[derive(Debug, Clone)]
pub struct StochasticSignalGenerator {
    highest: Maximum,
    lowest: Minimum,
    d_line: SimpleMovingAverage,
    warmup: usize,
    oversold: f64,
    overbought: f64,
    bars_seen: usize,
}

impl StochasticSignalGenerator {
    pub fn new(k_period: usize, d_period: usize, oversold: f64, overbought: f64) -> EngineResult<Self> {
        require_period("stochastic %K", k_period)?;
        require_period("stochastic %D", d_period)?;
        Ok(Self {
            highest: Maximum::new(k_period).map_err(|e| indicator_error("Maximum", e))?,
            lowest: Minimum::new(k_period).map_err(|e| indicator_error("Minimum", e))?,
            d_line: SimpleMovingAverage::new(d_period).map_err(|e| indicator_error("SMA", e))?,
            warmup: k_period + d_period - 1,
            oversold,
            overbought,
            bars_seen: 0,
        })
    }
}

impl SignalGenerator for StochasticSignalGenerator {
    fn name(&self) -> &str {
        "Stochastic"
    }

    fn on_price(&mut self, price: f64) -> Signal {
        let high = self.highest.next(price);
        let low = self.lowest.next(price);
        let range = high - low;
        let k = if range > 0.0 {
            (price - low) / range * 100.0
        } else {
            50.0
        };
        let d = self.d_line.next(k);
        self.bars_seen += 1;

        if self.bars_seen < self.warmup {
            Signal::Hold
        } else if k <= self.oversold && k > d {
            Signal::Buy
        } else if k >= self.overbought && k < d {
            Signal::Sell
        } else {
            Signal::Hold
        }
    }

    fn reset(&mut self) {
        self.highest.reset();
        self.lowest.reset();
        self.d_line.reset();
        self.bars_seen = 0;
    }

    fn boxed_clone(&self) -> Box<dyn SignalGenerator> {
        Box::new(self.clone())
    }
}

// ============================================================================
// 4. Bollinger Bands
// ============================================================================

/// Mean reversion: buy under the lower band, sell over the upper band.
/// Breakout: buy over the upper band, sell back under the middle band.
#[derive(Debug, Clone)]
pub struct BollingerSignalGenerator {
    bands: BollingerBands,
    period: usize,
    mean_reversion: bool,
    bars_seen: usize,
}

impl BollingerSignalGenerator {
    pub fn new(period: usize, multiplier: f64, mean_reversion: bool) -> EngineResult<Self> {
        require_period("Bollinger", period)?;
        if !(multiplier > 0.0) {
            return Err(EngineError::Indicator(format!(
                "Bollinger multiplier must be positive, got {multiplier}"
            )));
        }
        Ok(Self {
            bands: BollingerBands::new(period, multiplier)
                .map_err(|e| indicator_error("BollingerBands", e))?,
            period,
            mean_reversion,
            bars_seen: 0,
        })
    }
}

impl SignalGenerator for BollingerSignalGenerator {
    fn name(&self) -> &str {
        "BollingerBands"
    }

    fn on_price(&mut self, price: f64) -> Signal {
        let out = self.bands.next(price);
        self.bars_seen += 1;

        if self.bars_seen < self.period || out.upper - out.lower <= 0.0 {
            return Signal::Hold;
        }

        if self.mean_reversion {
            if price < out.lower {
                Signal::Buy
            } else if price > out.upper {
                Signal::Sell
            } else {
                Signal::Hold
            }
        } else if price > out.upper {
            Signal::Buy
        } else if price < out.average {
            Signal::Sell
        } else {
            Signal::Hold
        }
    }

    fn reset(&mut self) {
        self.bands.reset();
        self.bars_seen = 0;
    }

    fn boxed_clone(&self) -> Box<dyn SignalGenerator> {
        Box::new(self.clone())
    }
}

// ============================================================================
// 5. Channel breakout (Donchian)
// ============================================================================

/// Buy above the previous `period`-bar high, sell below the previous low
#[derive(Debug, Clone)]
pub struct ChannelBreakoutSignalGenerator {
    highest: Maximum,
    lowest: Minimum,
    period: usize,
    prev_high: f64,
    prev_low: f64,
    bars_seen: usize,
}

impl ChannelBreakoutSignalGenerator {
    pub fn new(period: usize) -> EngineResult<Self> {
        require_period("channel", period)?;
        Ok(Self {
            highest: Maximum::new(period).map_err(|e| indicator_error("Maximum", e))?,
            lowest: Minimum::new(period).map_err(|e| indicator_error("Minimum", e))?,
            period,
            prev_high: f64::MAX,
            prev_low: f64::MIN,
            bars_seen: 0,
        })
    }
}

impl SignalGenerator for ChannelBreakoutSignalGenerator {
    fn name(&self) -> &str {
        "ChannelBreakout"
    }

    fn on_price(&mut self, price: f64) -> Signal {
        let signal = if self.bars_seen < self.period {
            Signal::Hold
        } else if price > self.prev_high {
            Signal::Buy
        } else if price < self.prev_low {
            Signal::Sell
        } else {
            Signal::Hold
        };

        self.prev_high = self.highest.next(price);
        self.prev_low = self.lowest.next(price);
        self.bars_seen += 1;
        signal
    }

    fn reset(&mut self) {
        self.highest.reset();
        self.lowest.reset();
        self.prev_high = f64::MAX;
        self.prev_low = f64::MIN;
        self.bars_seen = 0;
    }

    fn boxed_clone(&self) -> Box<dyn SignalGenerator> {
        Box::new(self.clone())
    }
}

// ============================================================================
// 6. Combos
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineMode {
    /// All generators must agree on Buy/Sell
    Unanimous,
    /// More than half of the generators agree
    Majority,
}

pub struct ComboSignalGenerator {
    name: String,
    generators: Vec<Box<dyn SignalGenerator>>,
    mode: CombineMode,
}

impl ComboSignalGenerator {
    pub fn new(name: String, generators: Vec<Box<dyn SignalGenerator>>, mode: CombineMode) -> Self {
        Self {
            name,
            generators,
            mode,
        }
    }
}

impl SignalGenerator for ComboSignalGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_price(&mut self, price: f64) -> Signal {
        // Every member sees every price, even when the outcome is already decided
        let signals: Vec<Signal> = self.generators.iter_mut().map(|g| g.on_price(price)).collect();
        let total = signals.len();
        if total == 0 {
            return Signal::Hold;
        }

        let buys = signals.iter().filter(|s| **s == Signal::Buy).count();
        let sells = signals.iter().filter(|s| **s == Signal::Sell).count();
        let needed = match self.mode {
            CombineMode::Unanimous => total,
            CombineMode::Majority => total / 2 + 1,
        };

        if buys >= needed {
            Signal::Buy
        } else if sells >= needed {
            Signal::Sell
        } else {
            Signal::Hold
        }
    }

    fn reset(&mut self) {
        for g in &mut self.generators {
            g.reset();
        }
    }

    fn boxed_clone(&self) -> Box<dyn SignalGenerator> {
        Box::new(ComboSignalGenerator {
            name: self.name.clone(),
            generators: self.generators.iter().map(|g| g.boxed_clone()).collect(),
            mode: self.mode,
        })
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Serializable description of a signal generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IndicatorConfig {
    MaCross {
        kind: MaKind,
        fast_period: usize,
        slow_period: usize,
    },
    Rsi {
        period: usize,
        oversold: f64,
        overbought: f64,
    },
    Stochastic {
        k_period: usize,
        d_period: usize,
        oversold: f64,
        overbought: f64,
    },
    Bollinger {
        period: usize,
        std_dev_multiplier: f64,
        mean_reversion: bool,
    },
    ChannelBreakout {
        period: usize,
    },
    Combo {
        mode: CombineMode,
        members: Vec<IndicatorConfig>,
    },
}

pub fn build_signal_generator(config: &IndicatorConfig) -> EngineResult<Box<dyn SignalGenerator>> {
    Ok(match config {
        IndicatorConfig::MaCross {
            kind,
            fast_period,
            slow_period,
        } => Box::new(MaCrossSignalGenerator::new(*kind, *fast_period, *slow_period)?),

        IndicatorConfig::Rsi {
            period,
            oversold,
            overbought,
        } => Box::new(RsiSignalGenerator::new(*period, *oversold, *overbought)?),

        IndicatorConfig::Stochastic {
            k_period,
            d_period,
            oversold,
            overbought,
        } => Box::new(StochasticSignalGenerator::new(
            *k_period,
            *d_period,
            *oversold,
            *overbought,
        )?),

        IndicatorConfig::Bollinger {
            period,
            std_dev_multiplier,
            mean_reversion,
        } => Box::new(BollingerSignalGenerator::new(
            *period,
            *std_dev_multiplier,
            *mean_reversion,
        )?),

        IndicatorConfig::ChannelBreakout { period } => {
            Box::new(ChannelBreakoutSignalGenerator::new(*period)?)
        }

        IndicatorConfig::Combo { mode, members } => {
            let generators = members
                .iter()
                .map(build_signal_generator)
                .collect::<EngineResult<Vec<_>>>()?;
            let name = generators
                .iter()
                .map(|g| g.name())
                .collect::<Vec<_>>()
                .join("+");
            Box::new(ComboSignalGenerator::new(name, generators, *mode))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(generator: &mut dyn SignalGenerator, prices: &[f64]) -> Vec<Signal> {
        prices.iter().map(|&p| generator.on_price(p)).collect()
    }

    fn falling_then_rising(n: usize) -> Vec<f64> {
        let mut prices: Vec<f64> = (0..n).map(|i| 0.80 - i as f64 * 0.02).collect();
        let bottom = *prices.last().unwrap();
        prices.extend((1..=n).map(|i| bottom + i as f64 * 0.02));
        prices
    }

    #[test]
    fn test_ma_cross_buys_after_reversal() {
        for kind in [MaKind::Sma, MaKind::Ema] {
            let mut gen = MaCrossSignalGenerator::new(kind, 3, 8).unwrap();
            let signals = feed(&mut gen, &falling_then_rising(20));
            let first_buy = signals.iter().position(|s| *s == Signal::Buy);
            assert!(first_buy.is_some(), "{kind:?} never crossed up");
            assert!(first_buy.unwrap() >= 20);
            // No signals during warm-up
            assert!(signals[..8].iter().all(|s| *s == Signal::Hold));
        }
    }

    #[test]
    fn test_rsi_thresholds() {
        let mut gen = RsiSignalGenerator::new(5, 30.0, 70.0).unwrap();
        let falling: Vec<f64> = (0..15).map(|i| 0.9 - i as f64 * 0.03).collect();
        assert_eq!(feed(&mut gen, &falling).last(), Some(&Signal::Buy));

        gen.reset();
        let rising: Vec<f64> = (0..15).map(|i| 0.1 + i as f64 * 0.03).collect();
        assert_eq!(feed(&mut gen, &rising).last(), Some(&Signal::Sell));
    }

    #[test]
    fn test_stochastic_buys_on_upturn_from_low() {
        let mut gen = StochasticSignalGenerator::new(14, 3, 20.0, 80.0).unwrap();
        let mut prices: Vec<f64> = (0..20).map(|i| 0.95 - i as f64 * 0.02).collect();
        prices.push(0.57 + 0.01);
        let signals = feed(&mut gen, &prices);
        assert_eq!(signals.last(), Some(&Signal::Buy));
        // Steady decline: %K pinned at 0, never above %D
        assert!(signals[..20].iter().all(|s| *s != Signal::Buy));
    }

    #[test]
    fn test_bollinger_modes() {
        let mut prices = vec![0.5; 20];
        prices.push(0.3);

        let mut reversion = BollingerSignalGenerator::new(20, 2.0, true).unwrap();
        assert_eq!(feed(&mut reversion, &prices).last(), Some(&Signal::Buy));

        let mut breakout = BollingerSignalGenerator::new(20, 2.0, false).unwrap();
        assert_eq!(feed(&mut breakout, &prices).last(), Some(&Signal::Sell));

        let mut prices = vec![0.5; 20];
        prices.push(0.7);
        breakout.reset();
        assert_eq!(feed(&mut breakout, &prices).last(), Some(&Signal::Buy));
    }

    #[test]
    fn test_flat_prices_never_signal() {
        let config = IndicatorConfig::Bollinger {
            period: 5,
            std_dev_multiplier: 2.0,
            mean_reversion: true,
        };
        let mut gen = build_signal_generator(&config).unwrap();
        assert!(feed(gen.as_mut(), &[0.5; 30]).iter().all(|s| *s == Signal::Hold));
    }

    #[test]
    fn test_channel_breakout_uses_previous_window() {
        let mut gen = ChannelBreakoutSignalGenerator::new(5).unwrap();
        let signals = feed(&mut gen, &[0.40, 0.42, 0.41, 0.43, 0.42, 0.44, 0.35]);
        assert!(signals[..5].iter().all(|s| *s == Signal::Hold));
        assert_eq!(signals[5], Signal::Buy);
        assert_eq!(signals[6], Signal::Sell);
    }

    #[test]
    fn test_combo_unanimous_requires_agreement() {
        let config = IndicatorConfig::Combo {
            mode: CombineMode::Unanimous,
            members: vec![
                IndicatorConfig::ChannelBreakout { period: 3 },
                IndicatorConfig::ChannelBreakout { period: 5 },
            ],
        };
        let mut gen = build_signal_generator(&config).unwrap();
        assert_eq!(gen.name(), "ChannelBreakout+ChannelBreakout");

        // Breaks the 3-bar high but not the 5-bar high
        let signals = feed(gen.as_mut(), &[0.50, 0.60, 0.40, 0.42, 0.41, 0.55]);
        assert_eq!(signals[5], Signal::Hold);
        // New high over both windows
        assert_eq!(gen.on_price(0.70), Signal::Buy);
    }

    #[test]
    fn test_boxed_clone_is_independent() {
        let mut original = build_signal_generator(&IndicatorConfig::ChannelBreakout { period: 2 }).unwrap();
        let mut copy = original.boxed_clone();
        feed(original.as_mut(), &[0.5, 0.5]);
        assert_eq!(original.on_price(0.9), Signal::Buy);
        // The copy has seen nothing and is still warming up
        assert_eq!(copy.on_price(0.9), Signal::Hold);
    }

    #[test]
    fn test_invalid_configs_are_errors() {
        assert!(build_signal_generator(&IndicatorConfig::Rsi {
            period: 0,
            oversold: 30.0,
            overbought: 70.0
        })
        .is_err());
        assert!(build_signal_generator(&IndicatorConfig::Bollinger {
            period: 20,
            std_dev_multiplier: 0.0,
            mean_reversion: true
        })
        .is_err());
    }
}

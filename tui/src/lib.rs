//! Console status dashboard.
//!
//! Read-only observer over the indexers' and stream client's snapshot
//! handles; `q` quits and triggers graceful shutdown of the whole process.

use std::io;
use std::sync::Arc;

use chrono::Utc;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use indexer_engine::{IndexerPhase, IndexerStatusSnapshot, OrderIndexer};
use orderbook_ws_engine::{StreamMetrics, StreamMetricsSnapshot};
use ratatui::{
    Frame, Terminal,
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout},
    style::{Color, Style},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Gauge, Paragraph},
};
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;

pub struct Dashboard {
    indexers: Vec<Arc<OrderIndexer>>,
    stream: StreamMetrics,
    cancel: CancellationToken,
    shutting_down: bool,
}

impl Dashboard {
    pub fn new(
        indexers: Vec<Arc<OrderIndexer>>,
        stream: StreamMetrics,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            indexers,
            stream,
            cancel,
            shutting_down: false,
        }
    }

    /// Run the dashboard until `q` or external cancellation.
    pub async fn run(&mut self) -> io::Result<()> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        loop {
            terminal.draw(|f| self.ui(f))?;

            if self.cancel.is_cancelled() {
                break;
            }
            if event::poll(Duration::from_millis(50))? {
                if let Event::Key(key) = event::read()? {
                    if key.code == KeyCode::Char('q') {
                        self.cancel.cancel();
                        // show "shutting down" briefly
                        self.shutting_down = true;
                        for _ in 0..5 {
                            terminal.draw(|f| self.ui(f))?;
                            sleep(Duration::from_millis(50)).await;
                        }
                        break;
                    }
                }
            }

            sleep(Duration::from_millis(200)).await;
        }

        disable_raw_mode()?;
        execute!(
            terminal.backend_mut(),
            LeaveAlternateScreen,
            DisableMouseCapture
        )?;
        terminal.show_cursor()?;
        Ok(())
    }

    fn ui(&self, f: &mut Frame) {
        let size = f.size();
        let statuses: Vec<IndexerStatusSnapshot> =
            self.indexers.iter().map(|idx| idx.status()).collect();
        let stream = self.stream.snapshot();

        let backfill_rows: u16 = statuses
            .iter()
            .flat_map(|s| &s.backfill)
            .filter(|w| w.running)
            .count()
            .max(1) as u16;
        let upkeep_rows = statuses.len().max(1) as u16;

        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints(
                [
                    Constraint::Length(3),                 // backfill progress
                    Constraint::Length(4),                 // stream health
                    Constraint::Length(backfill_rows + 2), // active backfills
                    Constraint::Length(upkeep_rows + 2),   // upkeep workers
                    Constraint::Percentage(100),
                ]
                .as_ref(),
            )
            .split(size);

        let (done, total) = statuses.iter().fold((0usize, 0usize), |(done, total), s| {
            (
                done + s.backfill.iter().filter(|w| w.done).count(),
                total + s.backfill.len(),
            )
        });
        let ratio = if total > 0 {
            (done as f64) / (total as f64)
        } else {
            0.0
        }
        .clamp(0.0, 1.0);
        let title = if self.shutting_down {
            "Backfill progress (shutting down...)"
        } else {
            "Backfill progress (q to quit)"
        };
        let gauge = Gauge::default()
            .block(Block::default().borders(Borders::ALL).title(title))
            .ratio(ratio)
            .label(Span::styled(
                format!("Ranges {done}/{total}"),
                Style::default().fg(Color::White),
            ));
        f.render_widget(gauge, chunks[0]);

        let stream_block = Paragraph::new(Text::from(Self::stream_lines(&stream)))
            .block(Block::default().borders(Borders::ALL).title("Stream"));
        f.render_widget(stream_block, chunks[1]);

        let backfill_block = Paragraph::new(Text::from(Self::backfill_lines(&statuses))).block(
            Block::default()
                .borders(Borders::ALL)
                .title("Active backfills"),
        );
        f.render_widget(backfill_block, chunks[2]);

        let upkeep_block = Paragraph::new(Text::from(Self::upkeep_lines(&statuses)))
            .block(Block::default().borders(Borders::ALL).title("Upkeep"));
        f.render_widget(upkeep_block, chunks[3]);
    }

    fn stream_lines(stream: &StreamMetricsSnapshot) -> Vec<Line<'static>> {
        let now_ms = Utc::now().timestamp_millis();
        let state = if stream.connected {
            Span::styled("connected", Style::default().fg(Color::Green))
        } else {
            Span::styled(
                format!("disconnected (retry in {} ms)", stream.backoff_ms),
                Style::default().fg(Color::Red),
            )
        };
        let last_message = match stream.last_message_ms {
            Some(ts) => format!("{} s ago", ((now_ms - ts).max(0)) / 1000),
            None => "never".to_string(),
        };
        vec![
            Line::from(vec![Span::raw("state: "), state]),
            Line::from(format!(
                "last message: {last_message}  messages {}  asks {}  bids {}  reconnects {}  parse errors {}",
                stream.messages,
                stream.asks_upserted,
                stream.bids_upserted,
                stream.reconnects,
                stream.parse_errors,
            )),
        ]
    }

    fn backfill_lines(statuses: &[IndexerStatusSnapshot]) -> Vec<Line<'static>> {
        let mut lines = Vec::new();
        for status in statuses {
            for worker in status.backfill.iter().filter(|w| w.running) {
                lines.push(Line::from(format!(
                    "{:<5} {}  fetched {:>8}  committed {:>8}  requests {:>6}  errors {:>4}",
                    status.feed.to_string(),
                    worker.range.start.format("%Y-%m-%d"),
                    worker.stats.fetched,
                    worker.stats.committed,
                    worker.stats.requests,
                    worker.stats.errors,
                )));
            }
        }
        if lines.is_empty() {
            lines.push(Line::from(Span::styled(
                "no active backfill workers",
                Style::default().fg(Color::DarkGray),
            )));
        }
        lines
    }

    fn upkeep_lines(statuses: &[IndexerStatusSnapshot]) -> Vec<Line<'static>> {
        statuses
            .iter()
            .map(|status| match (&status.upkeep, status.phase) {
                (Some(upkeep), _) => Line::from(format!(
                    "{:<5} watermark {}  fetched {:>8}  committed {:>8}  requests {:>6}  errors {:>4}",
                    status.feed.to_string(),
                    upkeep.watermark.format("%Y-%m-%d %H:%M:%S"),
                    upkeep.stats.fetched,
                    upkeep.stats.committed,
                    upkeep.stats.requests,
                    upkeep.stats.errors,
                )),
                (None, phase) => Line::from(Span::styled(
                    format!("{:<5} {}", status.feed.to_string(), phase_label(phase)),
                    Style::default().fg(Color::DarkGray),
                )),
            })
            .collect()
    }
}

fn phase_label(phase: IndexerPhase) -> &'static str {
    match phase {
        IndexerPhase::Starting => "starting",
        IndexerPhase::Backfilling => "backfilling",
        IndexerPhase::Upkeep => "upkeep",
    }
}

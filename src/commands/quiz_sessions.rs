//! `quiz-sessions`: rebuild session windows from recorded quiz actions

use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDate;

use super::{CommandContext, RunOverrides, SyncSummary};
use crate::domain::session_window::SessionWindower;
use crate::infrastructure::quiz_session_repository::QuizSessionStore;
use crate::sync::action_cursor::QuizActionCursor;
use crate::sync::mappers::QuizSessionMapper;

#[derive(Debug, Clone, Default, clap::Args)]
pub struct QuizSessionsArgs {
    /// Only subjects with actions on or after this date (YYYY-MM-DD)
    #[arg(long)]
    pub from: Option<NaiveDate>,

    /// Gap that closes a session, measured from the session start
    #[arg(long)]
    pub gap_seconds: Option<u64>,

    #[command(flatten)]
    pub run: RunOverrides,
}

pub async fn quiz_sessions(ctx: &CommandContext, args: QuizSessionsArgs) -> Result<SyncSummary> {
    let quiz = &ctx.config.quiz;
    let gap = Duration::from_secs(args.gap_seconds.unwrap_or(quiz.session_gap_seconds));
    let since = args
        .from
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|start| start.and_utc());

    let mut cursor = QuizActionCursor::new(ctx.db.pool().clone(), since, quiz.groups_per_page);
    let mapper = QuizSessionMapper::new(SessionWindower::new(gap));

    Ok(ctx.execute(&mut cursor, &mapper, &QuizSessionStore, &args.run).await)
}

use std::sync::Arc;

use api_types::expense::{Expense, ExpensePatch, NewExpense};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use engine::{
    CategoryResolver, CategorySet, ExpenseController, LocalCache, Phase, QueryState, RemoteStore,
    copy_expenses,
};
use tracing::info;

use crate::{
    config::{AddArgs, AppConfig, CategoriesCommand, Command, EditArgs},
    error::{AppError, Result},
};

/// Everything a subcommand needs, wired for one store.
struct Session<S, C> {
    store: Arc<S>,
    resolver: CategoryResolver<S, C>,
    controller: ExpenseController<S>,
    user_id: Option<String>,
    tz: Tz,
    json: bool,
}

pub async fn run<S, C>(
    store: Arc<S>,
    cache: C,
    config: &AppConfig,
    command: Command,
) -> Result<()>
where
    S: RemoteStore,
    C: LocalCache,
{
    let tz: Tz = config
        .timezone
        .parse()
        .map_err(|err| AppError::Input(format!("invalid timezone: {err}")))?;
    let user_id = config.user_id().map(str::to_string);

    let resolver = CategoryResolver::new(Arc::clone(&store), cache);
    resolver.resolve(user_id.as_deref()).await;
    let controller = ExpenseController::new(Arc::clone(&store), user_id.clone())
        .with_page_size(config.page_size)
        .with_categories(resolver.watch());

    let session = Session {
        store,
        resolver,
        controller,
        user_id,
        tz,
        json: config.json,
    };

    match command {
        Command::List { pages } => session.list(pages).await,
        Command::Watch { updates } => session.watch(updates).await,
        Command::Add(args) => session.add(args).await,
        Command::Edit(args) => session.edit(args).await,
        Command::Remove { id } => {
            session.controller.remove_expense(&id).await?;
            println!("removed {id}");
            Ok(())
        }
        Command::Categories { command } => session.categories(command).await,
        Command::Copy { from, to } => {
            let copied = copy_expenses(session.store.as_ref(), &from, &to, Utc::now()).await?;
            println!("copied {copied} expenses from {from} to {to}");
            Ok(())
        }
    }
}

impl<S, C> Session<S, C>
where
    S: RemoteStore,
    C: LocalCache,
{
    async fn list(&self, pages: usize) -> Result<()> {
        self.controller.load_first_page().await?;
        for _ in 1..pages {
            if !self.controller.state().has_more {
                break;
            }
            self.controller.load_next_page().await?;
        }

        let state = self.controller.state();
        self.print_expenses(&state.expenses)?;
        if state.has_more && !self.json {
            println!("… more available, use --pages {}", pages + 1);
        }
        Ok(())
    }

    async fn watch(&self, updates: Option<usize>) -> Result<()> {
        let binder = self.controller.watch_live().await;
        let mut rx = binder.watch();
        let mut seen = 0;

        loop {
            let state: QueryState<Expense> = rx.borrow_and_update().clone();
            if !state.loading {
                match &state.error {
                    Some(err) => eprintln!("error: {err}"),
                    None => {
                        if !self.json {
                            let now = Utc::now().with_timezone(&self.tz);
                            println!("--- {}", now.format("%H:%M:%S"));
                        }
                        self.print_expenses(&state.items)?;
                    }
                }
                seen += 1;
                if updates.is_some_and(|limit| seen >= limit) {
                    break;
                }
            }

            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    break;
                }
            }
        }
        info!(updates = seen, "stopped watching");
        Ok(())
    }

    async fn add(&self, args: AddArgs) -> Result<()> {
        self.check_category(&args.category)?;
        let date = match args.date.as_deref() {
            Some(raw) => parse_date(raw, self.tz)?,
            None => Utc::now(),
        };
        let payload = NewExpense {
            amount: args.amount,
            date,
            category: args.category,
            description: args.description,
            tags: args.tags,
            location: args.location,
        };

        let id = self.controller.add_expense(payload).await?;
        println!("added {id}");
        Ok(())
    }

    async fn edit(&self, args: EditArgs) -> Result<()> {
        if let Some(category) = &args.category {
            self.check_category(category)?;
        }
        let tags = if args.clear_tags {
            Some(Vec::new())
        } else if args.tags.is_empty() {
            None
        } else {
            Some(args.tags)
        };
        let date = args
            .date
            .as_deref()
            .map(|raw| parse_date(raw, self.tz))
            .transpose()?;
        let patch = ExpensePatch {
            amount: args.amount,
            date,
            category: args.category,
            description: args.description,
            tags,
            location: args.location,
        };

        self.controller.update_expense(&args.id, patch).await?;
        println!("updated {}", args.id);
        Ok(())
    }

    async fn categories(&self, command: CategoriesCommand) -> Result<()> {
        let user_id = self.user_id.as_deref();
        let categories = match command {
            CategoriesCommand::List => self.resolver.current(),
            CategoriesCommand::Add { label } => self.resolver.add(user_id, &label).await?,
            CategoriesCommand::Remove { value } => self.resolver.remove(user_id, &value).await?,
        };
        self.print_categories(&categories)
    }

    fn check_category(&self, key: &str) -> Result<()> {
        if self.resolver.current().contains(key) {
            return Ok(());
        }
        Err(AppError::Input(format!(
            "unknown category '{key}', see `spendsync categories list`"
        )))
    }

    fn print_expenses(&self, expenses: &[Expense]) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(expenses)?);
            return Ok(());
        }
        if expenses.is_empty() {
            let hint = match self.controller.state().phase() {
                Phase::Error => "could not load expenses",
                _ if self.user_id.is_none() => "not signed in, set --user",
                _ => "no expenses yet",
            };
            println!("{hint}");
            return Ok(());
        }

        let categories = self.resolver.current();
        for expense in expenses {
            println!("{}", render_row(expense, &categories, self.tz));
        }
        Ok(())
    }

    fn print_categories(&self, categories: &CategorySet) -> Result<()> {
        let views = categories.display();
        if self.json {
            println!("{}", serde_json::to_string_pretty(&views)?);
            return Ok(());
        }
        for view in views {
            let marker = if CategorySet::is_built_in(&view.value) {
                ' '
            } else {
                '*'
            };
            println!("{marker} {:<16} {:<20} {}", view.value, view.label, view.color);
        }
        Ok(())
    }
}

fn render_row(expense: &Expense, categories: &CategorySet, tz: Tz) -> String {
    let mut row = format!(
        "{}  {:>10.2}  {:<16}  {}",
        expense.date.with_timezone(&tz).format("%Y-%m-%d %H:%M"),
        expense.amount,
        categories.label(&expense.category),
        expense.description,
    );
    if !expense.tags.is_empty() {
        row.push_str(&format!("  #{}", expense.tags.join(" #")));
    }
    if !expense.location.is_empty() {
        row.push_str(&format!("  @ {}", expense.location));
    }
    row.push_str(&format!("  [{}]", expense.id));
    row
}

/// Reads `YYYY-MM-DD` as local noon in `tz`, or a full RFC 3339 instant.
fn parse_date(raw: &str, tz: Tz) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
        return Ok(instant.with_timezone(&Utc));
    }
    let day = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| AppError::Input(format!("invalid date '{raw}', expected YYYY-MM-DD")))?;
    day.and_hms_opt(12, 0, 0)
        .and_then(|noon| tz.from_local_datetime(&noon).earliest())
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| {
            AppError::Input(format!("date '{raw}' does not exist in {}", tz.name()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expense() -> Expense {
        let at = Utc.with_ymd_and_hms(2024, 7, 1, 10, 30, 0).unwrap();
        Expense {
            id: "e1".to_string(),
            user_id: "alice".to_string(),
            amount: 12.5,
            date: at,
            category: "food".to_string(),
            description: "Lunch".to_string(),
            tags: vec!["work".to_string(), "team".to_string()],
            location: "Milano".to_string(),
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn plain_dates_are_local_noon() {
        let date = parse_date("2024-01-15", chrono_tz::Europe::Rome).unwrap();
        assert_eq!(date, Utc.with_ymd_and_hms(2024, 1, 15, 11, 0, 0).unwrap());
    }

    #[test]
    fn rfc3339_dates_keep_their_offset() {
        let date = parse_date("2024-01-15T08:00:00+02:00", chrono_tz::Europe::Rome).unwrap();
        assert_eq!(date, Utc.with_ymd_and_hms(2024, 1, 15, 6, 0, 0).unwrap());
    }

    #[test]
    fn garbage_dates_are_rejected() {
        assert!(parse_date("15/01/2024", chrono_tz::UTC).is_err());
    }

    #[test]
    fn rows_render_in_the_configured_timezone() {
        let row = render_row(&expense(), &CategorySet::defaults(), chrono_tz::Europe::Rome);
        assert!(row.starts_with("2024-07-01 12:30"));
        assert!(row.contains("Food & Dining"));
        assert!(row.contains("#work #team"));
        assert!(row.contains("@ Milano"));
        assert!(row.ends_with("[e1]"));
    }
}

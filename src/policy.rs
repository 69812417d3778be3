//! Autograde and which-to-grade policy per question type.
//!
//! Every question type owns two menus: the autograde modes it can be scored with and the
//! attempt-selection rules that apply. An empty menu means the type is not autogradable.
//! [`resolve`] turns the settings an instructor asked for into values drawn from those menus.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuestionType {
    Actex,
    Activecode,
    Clickablearea,
    Codelens,
    Datafile,
    Dragndrop,
    External,
    Fillintheblank,
    Groupsub,
    Hparsons,
    Khanex,
    LpBuild,
    Mchoice,
    Page,
    Parsonsprob,
    Poll,
    Quizly,
    Reveal,
    Selectquestion,
    Shortanswer,
    Showeval,
    Video,
    Webwork,
    Youtube,
}

impl QuestionType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "actex" => Some(Self::Actex),
            "activecode" => Some(Self::Activecode),
            "clickablearea" => Some(Self::Clickablearea),
            "codelens" => Some(Self::Codelens),
            "datafile" => Some(Self::Datafile),
            "dragndrop" => Some(Self::Dragndrop),
            "external" => Some(Self::External),
            "fillintheblank" => Some(Self::Fillintheblank),
            "groupsub" => Some(Self::Groupsub),
            "hparsons" => Some(Self::Hparsons),
            "khanex" => Some(Self::Khanex),
            "lp_build" => Some(Self::LpBuild),
            "mchoice" => Some(Self::Mchoice),
            "page" => Some(Self::Page),
            "parsonsprob" => Some(Self::Parsonsprob),
            "poll" => Some(Self::Poll),
            "quizly" => Some(Self::Quizly),
            "reveal" => Some(Self::Reveal),
            "selectquestion" => Some(Self::Selectquestion),
            "shortanswer" => Some(Self::Shortanswer),
            "showeval" => Some(Self::Showeval),
            "video" => Some(Self::Video),
            "webwork" => Some(Self::Webwork),
            "youtube" => Some(Self::Youtube),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Actex => "actex",
            Self::Activecode => "activecode",
            Self::Clickablearea => "clickablearea",
            Self::Codelens => "codelens",
            Self::Datafile => "datafile",
            Self::Dragndrop => "dragndrop",
            Self::External => "external",
            Self::Fillintheblank => "fillintheblank",
            Self::Groupsub => "groupsub",
            Self::Hparsons => "hparsons",
            Self::Khanex => "khanex",
            Self::LpBuild => "lp_build",
            Self::Mchoice => "mchoice",
            Self::Page => "page",
            Self::Parsonsprob => "parsonsprob",
            Self::Poll => "poll",
            Self::Quizly => "quizly",
            Self::Reveal => "reveal",
            Self::Selectquestion => "selectquestion",
            Self::Shortanswer => "shortanswer",
            Self::Showeval => "showeval",
            Self::Video => "video",
            Self::Webwork => "webwork",
            Self::Youtube => "youtube",
        }
    }

    /// Reading slots ("visit this page") are graded by completion count.
    pub fn is_reading(self) -> bool {
        matches!(self, Self::Page)
    }

    pub fn is_code_execution(self) -> bool {
        matches!(self, Self::Activecode | Self::Actex)
    }

    pub fn allowed_autograde(self) -> &'static [Autograde] {
        use Autograde::*;
        const ALL: &[Autograde] = &[Manual, AllOrNothing, PctCorrect, Interact];
        const WITH_PEER: &[Autograde] = &[Manual, AllOrNothing, PctCorrect, Interact, Peer, PeerChat];
        const INTERACT_ONLY: &[Autograde] = &[Interact];
        match self {
            Self::Mchoice => WITH_PEER,
            Self::Actex
            | Self::Activecode
            | Self::Clickablearea
            | Self::Codelens
            | Self::Dragndrop
            | Self::Fillintheblank
            | Self::Hparsons
            | Self::Khanex
            | Self::LpBuild
            | Self::Parsonsprob
            | Self::Quizly
            | Self::Selectquestion
            | Self::Shortanswer
            | Self::Webwork => ALL,
            Self::Page | Self::Poll | Self::Showeval | Self::Video | Self::Youtube => INTERACT_ONLY,
            Self::Datafile | Self::External | Self::Groupsub | Self::Reveal => &[],
        }
    }

    pub fn allowed_which_to_grade(self) -> &'static [WhichToGrade] {
        use WhichToGrade::*;
        const ALL: &[WhichToGrade] = &[FirstAnswer, LastAnswer, BestAnswer];
        const WITH_ALL: &[WhichToGrade] = &[FirstAnswer, LastAnswer, BestAnswer, AllAnswer];
        match self {
            Self::Mchoice => WITH_ALL,
            Self::Actex
            | Self::Activecode
            | Self::Clickablearea
            | Self::Codelens
            | Self::Dragndrop
            | Self::Fillintheblank
            | Self::Hparsons
            | Self::Khanex
            | Self::LpBuild
            | Self::Page
            | Self::Parsonsprob
            | Self::Quizly
            | Self::Selectquestion
            | Self::Shortanswer
            | Self::Showeval
            | Self::Webwork => ALL,
            Self::Datafile
            | Self::External
            | Self::Groupsub
            | Self::Poll
            | Self::Reveal
            | Self::Video
            | Self::Youtube => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Autograde {
    Manual,
    AllOrNothing,
    PctCorrect,
    Interact,
    Peer,
    PeerChat,
}

impl Autograde {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(Self::Manual),
            "all_or_nothing" => Some(Self::AllOrNothing),
            "pct_correct" => Some(Self::PctCorrect),
            "interact" => Some(Self::Interact),
            "peer" => Some(Self::Peer),
            "peer_chat" => Some(Self::PeerChat),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::AllOrNothing => "all_or_nothing",
            Self::PctCorrect => "pct_correct",
            Self::Interact => "interact",
            Self::Peer => "peer",
            Self::PeerChat => "peer_chat",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WhichToGrade {
    FirstAnswer,
    LastAnswer,
    BestAnswer,
    AllAnswer,
}

impl WhichToGrade {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "first_answer" => Some(Self::FirstAnswer),
            "last_answer" => Some(Self::LastAnswer),
            "best_answer" => Some(Self::BestAnswer),
            "all_answer" => Some(Self::AllAnswer),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FirstAnswer => "first_answer",
            Self::LastAnswer => "last_answer",
            Self::BestAnswer => "best_answer",
            Self::AllAnswer => "all_answer",
        }
    }
}

/// A setting as the caller sent it: missing, explicitly null, or a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requested<T> {
    Absent,
    Null,
    Value(T),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub autograde: Option<Autograde>,
    /// `None` is the empty which-to-grade ("not applicable").
    pub which_to_grade: Option<WhichToGrade>,
}

pub fn resolve(
    question_type: QuestionType,
    requested_autograde: Requested<Autograde>,
    requested_which: Requested<WhichToGrade>,
    has_unit_test: bool,
) -> Resolution {
    let mut autograde = match requested_autograde {
        Requested::Absent => Some(Autograde::Interact),
        Requested::Null => None,
        Requested::Value(a) => Some(a),
    };
    let mut which = match requested_which {
        Requested::Absent => Some(WhichToGrade::BestAnswer),
        Requested::Null => None,
        Requested::Value(w) => Some(w),
    };

    // Code without unit tests cannot be scored by comparing answers.
    if question_type.is_code_execution() && !has_unit_test {
        if let Some(a) = autograde {
            if a != Autograde::Manual && a != Autograde::Interact {
                autograde = Some(Autograde::Manual);
                which = None;
            }
        }
    }

    if autograde.is_none() {
        autograde = Some(Autograde::PctCorrect);
    }

    let allowed = question_type.allowed_autograde();
    let autograde = match autograde {
        _ if allowed.is_empty() => None,
        Some(a) if allowed.contains(&a) => Some(a),
        _ => Some(Autograde::Interact),
    };

    let allowed = question_type.allowed_which_to_grade();
    let which_to_grade = match which {
        _ if allowed.is_empty() => None,
        Some(w) if allowed.contains(&w) => Some(w),
        Some(_) => Some(WhichToGrade::BestAnswer),
        None => None,
    };

    Resolution {
        autograde,
        which_to_grade,
    }
}

/// Boundary check for caller-supplied values; defaults are never rejected here.
pub fn validate_requested(
    question_type: QuestionType,
    autograde: Requested<Autograde>,
    which: Requested<WhichToGrade>,
) -> Result<(), String> {
    if let Requested::Value(a) = autograde {
        if !question_type.allowed_autograde().contains(&a) {
            return Err(format!(
                "autograde {} is not allowed for {} questions",
                a.as_str(),
                question_type.as_str()
            ));
        }
    }
    if let Requested::Value(w) = which {
        if !question_type.allowed_which_to_grade().contains(&w) {
            return Err(format!(
                "which_to_grade {} is not allowed for {} questions",
                w.as_str(),
                question_type.as_str()
            ));
        }
    }
    Ok(())
}

pub fn autograde_menu(question_type: QuestionType) -> Vec<&'static str> {
    question_type
        .allowed_autograde()
        .iter()
        .map(|a| a.as_str())
        .collect()
}

pub fn which_to_grade_menu(question_type: QuestionType) -> Vec<&'static str> {
    question_type
        .allowed_which_to_grade()
        .iter()
        .map(|w| w.as_str())
        .collect()
}

//! Conversation scripts exchanged between maturing chips
//!
//! Scripts are read-only reference data. A script is picked by weight; scripts
//! that may carry voice notes are excluded when either chip's strategy forbids
//! them.

use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Which side of the exchange sends a line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptLine {
    pub speaker: Speaker,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationScript {
    pub name: String,
    pub lines: Vec<ScriptLine>,
    pub allow_voice_notes: bool,
    pub weight: u32,
}

impl ConversationScript {
    /// Build a script whose lines alternate, starting with the initiator.
    pub fn alternating(name: &str, weight: u32, allow_voice_notes: bool, texts: &[&str]) -> Self {
        let lines = texts
            .iter()
            .enumerate()
            .map(|(i, text)| ScriptLine {
                speaker: if i % 2 == 0 { Speaker::Initiator } else { Speaker::Responder },
                text: text.to_string(),
            })
            .collect();
        Self {
            name: name.to_string(),
            lines,
            allow_voice_notes,
            weight,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScriptLibrary {
    scripts: Vec<ConversationScript>,
}

impl ScriptLibrary {
    pub fn new(scripts: Vec<ConversationScript>) -> Self {
        Self { scripts }
    }

    pub fn builtin() -> Self {
        Self::new(vec![
            ConversationScript::alternating("casual_chat", 5, true, &[
                "Hey! How's it going?",
                "All good here, and you?",
                "Pretty good, busy week though",
                "Tell me about it, mine too",
                "Let's catch up properly this weekend",
                "Sounds great, talk soon",
            ]),
            ConversationScript::alternating("business_inquiry", 3, false, &[
                "Good morning, is the store open today?",
                "Good morning! Yes, until 6pm",
                "Great, do you still have the blue model in stock?",
                "We do, a few units left",
                "Perfect, I'll stop by this afternoon",
                "See you then, thanks for reaching out",
            ]),
            ConversationScript::alternating("support_request", 2, true, &[
                "Hi, could you help me with something quick?",
                "Of course, what do you need?",
                "My order hasn't shown up yet",
                "Let me check, do you have the order number?",
                "Yes, I'll send it in a minute",
                "No rush, I'm here",
                "Found it, thanks for the patience",
            ]),
            ConversationScript::alternating("social_interaction", 4, true, &[
                "Did you see the game last night?",
                "Yes! What an ending",
                "I couldn't believe that last goal",
                "Me neither, I was jumping on the couch",
                "We should watch the next one together",
                "Deal, I'll bring snacks",
            ]),
            ConversationScript::alternating("group_discussion", 2, true, &[
                "Are we still on for Saturday?",
                "As far as I know, yes",
                "Who else is coming?",
                "Everyone from last time, I think",
                "Nice, I'll book the table",
                "Perfect, let me know the time",
            ]),
            ConversationScript::alternating("morning_greeting", 4, true, &[
                "Good morning! Have a great day",
                "Morning! You too",
                "Coffee first, then the world",
                "Ha, same here",
                "Talk to you later",
            ]),
            ConversationScript::alternating("night_goodbye", 3, true, &[
                "Heading to bed, long day",
                "Same, I'm exhausted",
                "Sleep well!",
                "You too, good night",
                "Good night!",
            ]),
            ConversationScript::alternating("weekend_chat", 3, true, &[
                "Any plans for the weekend?",
                "Thinking about going to the beach",
                "Nice, the weather looks good",
                "Want to come along?",
                "Maybe, let me check and get back to you",
                "Sure, just let me know",
            ]),
            ConversationScript::alternating("joke_sharing", 2, true, &[
                "I've got a good one for you",
                "Go on then",
                "Why don't skeletons fight each other?",
                "No idea, why?",
                "They don't have the guts",
                "Haha that's terrible, I love it",
            ]),
            ConversationScript::alternating("news_discussion", 2, false, &[
                "Did you read the news about the new bridge?",
                "I did, they say it opens next month",
                "That will save me a lot of time",
                "Me too, the traffic is awful right now",
                "Let's hope they stick to the schedule",
                "Fingers crossed",
            ]),
        ])
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    /// Weighted random script, optionally restricted to voice-note-free ones.
    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R, voice_notes_allowed: bool) -> Option<&ConversationScript> {
        let eligible: Vec<&ConversationScript> = self
            .scripts
            .iter()
            .filter(|s| s.weight > 0 && !s.lines.is_empty())
            .filter(|s| voice_notes_allowed || !s.allow_voice_notes)
            .collect();

        let weights = WeightedIndex::new(eligible.iter().map(|s| s.weight)).ok()?;
        Some(eligible[weights.sample(rng)])
    }
}

impl Default for ScriptLibrary {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_builtin_scripts_alternate() {
        let library = ScriptLibrary::builtin();
        assert_eq!(library.len(), 10);
        for script in &library.scripts {
            assert_eq!(script.lines[0].speaker, Speaker::Initiator);
            assert!(script.lines.len() >= 5, "{} too short", script.name);
        }
    }

    #[test]
    fn test_pick_respects_voice_restriction() {
        let library = ScriptLibrary::builtin();
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..100 {
            let script = library.pick(&mut rng, false).unwrap();
            assert!(!script.allow_voice_notes);
        }
    }

    #[test]
    fn test_pick_from_empty_library() {
        let library = ScriptLibrary::new(vec![]);
        let mut rng = StdRng::seed_from_u64(9);
        assert!(library.pick(&mut rng, true).is_none());
    }
}

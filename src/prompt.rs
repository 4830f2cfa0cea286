use crate::models::GenerationRequest;
use crate::provider::text::ChatMessage;

/// Role and output-format directive sent ahead of every user instruction.
pub const SYSTEM_DIRECTIVE: &str = "You are an expert game developer who builds games for the web. \
Your job is to create a polished, interactive, responsive and fully playable game.

- Respond with a single self-contained HTML document containing the entire game.
- Put all JavaScript in a script tag with type=\"module\".
- External dependencies and libraries are strictly prohibited.
- Use simple shapes or inline graphics as placeholders for assets.
- Never use alert, confirm or prompt dialogs.
- Make the game fill the window without scrolling and work on every browser and device.

If anything is underspecified, fill in the blanks using common game and user experience design patterns. \
The game should feel more complete than the instructions it was given.";

const EDIT_DIRECTIVE: &str = "Apply the instruction above to the existing game below. \
Edit it in place, keep everything that is not affected, and respond with the complete updated HTML document.";

/// Builds the system/user message pair for one generation turn.
///
/// When a prior document exists it is embedded after the instruction so the
/// provider edits the current game instead of starting over.
pub fn compose_messages(request: &GenerationRequest) -> Vec<ChatMessage> {
    let user = match &request.prior_document {
        Some(prior) => format!(
            "{}\n\n{EDIT_DIRECTIVE}\n\n```html\n{prior}\n```",
            request.instruction
        ),
        None => format!("Create a game with this description: {}", request.instruction),
    };
    vec![ChatMessage::system(SYSTEM_DIRECTIVE), ChatMessage::user(user)]
}
